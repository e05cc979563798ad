//! The sampling pipeline: logits to next-token ids.
//!
//! Transformations per row, in order: logit bias, repetition penalty,
//! frequency penalty, presence penalty, temperature, top-k, top-p, then a
//! multinomial draw. Greedy decoding (`temperature == 0`) short-circuits
//! after the penalties with an argmax whose ties break toward the smaller
//! token id. Each sequence draws from its own seeded RNG, so identical
//! requests replay identically.

use std::collections::HashMap;

use candle_core::{DType, Tensor};
use rand::distributions::{Distribution, WeightedIndex};

use crate::core::sequence::Sequence;
use crate::error::{Error, Result};

/// One sampled token and the log-probability it was drawn with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampledToken {
    pub token_id: u32,
    pub logprob: f32,
}

/// Stateless sampling pipeline; all per-sequence state (history, RNG) lives
/// on the [`Sequence`].
#[derive(Debug, Default)]
pub struct Sampler;

impl Sampler {
    pub fn new() -> Self {
        Self
    }

    /// Sample the next token for one sequence from its logits row.
    pub fn sample_row(&self, row: &Tensor, seq: &mut Sequence) -> Result<SampledToken> {
        let mut logits: Vec<f32> = row.to_dtype(DType::F32)?.to_vec1()?;
        if logits.is_empty() {
            return Err(Error::internal("empty logits row"));
        }

        let params = seq.sampling().clone();
        if let Some(bias) = &params.logit_bias {
            apply_logit_bias(&mut logits, bias);
        }
        apply_penalties(
            &mut logits,
            seq.token_ids(),
            params.repetition_penalty,
            params.frequency_penalty,
            params.presence_penalty,
        );

        if params.temperature == 0.0 {
            return greedy(&logits);
        }
        if params.temperature != 1.0 {
            for v in &mut logits {
                *v /= params.temperature;
            }
        }

        // Sort descending once; top-k and top-p are both prefixes of it.
        let mut ranked: Vec<(u32, f32)> = logits
            .iter()
            .enumerate()
            .map(|(i, &v)| (i as u32, v))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        if params.top_k > 0 && params.top_k < ranked.len() {
            ranked.truncate(params.top_k);
        }

        let values: Vec<f32> = ranked.iter().map(|&(_, v)| v).collect();
        let kept = values.len();
        let probs_tensor = candle_nn::ops::softmax(
            &Tensor::from_vec(values, kept, &candle_core::Device::Cpu)?,
            0,
        )?;
        let mut probs: Vec<f32> = probs_tensor.to_vec1()?;

        if params.top_p < 1.0 {
            let mut cumulative = 0.0f32;
            let mut cutoff = probs.len();
            for (i, &p) in probs.iter().enumerate() {
                cumulative += p;
                if cumulative >= params.top_p {
                    cutoff = i + 1; // keep the token that crossed the mass
                    break;
                }
            }
            probs.truncate(cutoff);
            ranked.truncate(cutoff);
        }

        let total: f32 = probs.iter().sum();
        if !(total > 0.0) {
            return Err(Error::internal("all candidate tokens masked"));
        }
        let dist = WeightedIndex::new(&probs)
            .map_err(|e| Error::internal(format!("bad sampling weights: {e}")))?;
        let drawn = dist.sample(seq.rng_mut());
        Ok(SampledToken {
            token_id: ranked[drawn].0,
            logprob: (probs[drawn] / total).ln(),
        })
    }
}

/// Additive bias; `-inf` masks a token outright.
fn apply_logit_bias(logits: &mut [f32], bias: &HashMap<u32, f32>) {
    for (&token, &b) in bias {
        if let Some(v) = logits.get_mut(token as usize) {
            if b == f32::NEG_INFINITY {
                *v = f32::NEG_INFINITY;
            } else {
                *v += b;
            }
        }
    }
}

/// History-driven penalties. History is the sequence's full token list,
/// prompt included.
fn apply_penalties(
    logits: &mut [f32],
    history: &[u32],
    repetition_penalty: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
) {
    if history.is_empty()
        || (repetition_penalty == 1.0 && frequency_penalty == 0.0 && presence_penalty == 0.0)
    {
        return;
    }
    let mut counts: HashMap<u32, usize> = HashMap::new();
    for &token in history {
        *counts.entry(token).or_default() += 1;
    }
    for (&token, &count) in &counts {
        let Some(v) = logits.get_mut(token as usize) else {
            continue;
        };
        if repetition_penalty != 1.0 {
            if *v > 0.0 {
                *v /= repetition_penalty;
            } else {
                *v *= repetition_penalty;
            }
        }
        *v -= frequency_penalty * count as f32;
        *v -= presence_penalty;
    }
}

/// Argmax with ties broken toward the smaller token id; the recorded
/// log-probability is the log-softmax at the chosen token.
fn greedy(logits: &[f32]) -> Result<SampledToken> {
    let mut best_idx = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best_idx = i;
        }
    }
    if best_val == f32::NEG_INFINITY {
        return Err(Error::internal("all candidate tokens masked"));
    }
    let sum_exp: f32 = logits
        .iter()
        .filter(|v| v.is_finite())
        .map(|&v| (v - best_val).exp())
        .sum();
    Ok(SampledToken {
        token_id: best_idx as u32,
        logprob: -sum_exp.ln(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::SamplingParams;

    fn row(values: &[f32]) -> Tensor {
        Tensor::from_vec(values.to_vec(), values.len(), &candle_core::Device::Cpu).unwrap()
    }

    fn seq_with(params: SamplingParams, prompt: Vec<u32>) -> Sequence {
        Sequence::new(1, 0, prompt, Arc::new(params), 16)
    }

    #[test]
    fn test_greedy_picks_argmax() {
        let sampler = Sampler::new();
        let mut seq = seq_with(SamplingParams::greedy(), vec![0]);
        let out = sampler.sample_row(&row(&[0.1, 2.0, 0.5, 1.9]), &mut seq).unwrap();
        assert_eq!(out.token_id, 1);
        assert!(out.logprob <= 0.0);
    }

    #[test]
    fn test_greedy_tie_breaks_to_smaller_id() {
        let sampler = Sampler::new();
        let mut seq = seq_with(SamplingParams::greedy(), vec![0]);
        let out = sampler.sample_row(&row(&[1.0, 3.0, 3.0, 0.0]), &mut seq).unwrap();
        assert_eq!(out.token_id, 1);
    }

    #[test]
    fn test_logit_bias_masks_token() {
        let sampler = Sampler::new();
        let mut bias = HashMap::new();
        bias.insert(1u32, f32::NEG_INFINITY);
        let params = SamplingParams {
            temperature: 0.0,
            logit_bias: Some(bias),
            ..SamplingParams::default()
        };
        let mut seq = seq_with(params, vec![0]);
        let out = sampler.sample_row(&row(&[0.1, 9.0, 0.5]), &mut seq).unwrap();
        assert_eq!(out.token_id, 2);
    }

    #[test]
    fn test_repetition_penalty_discourages_history() {
        let sampler = Sampler::new();
        let params = SamplingParams {
            temperature: 0.0,
            repetition_penalty: 10.0,
            ..SamplingParams::default()
        };
        // Token 1 leads but sits in the history; the penalty drops it below 2.
        let mut seq = seq_with(params, vec![1]);
        let out = sampler.sample_row(&row(&[0.0, 1.0, 0.9]), &mut seq).unwrap();
        assert_eq!(out.token_id, 2);
    }

    #[test]
    fn test_zero_repetition_penalty_follows_the_division_rule() {
        let sampler = Sampler::new();
        let params = SamplingParams {
            temperature: 0.0,
            repetition_penalty: 0.0,
            ..SamplingParams::default()
        };

        // A positive history logit divides by zero to +inf and dominates.
        let mut seq = seq_with(params.clone(), vec![1]);
        let out = sampler.sample_row(&row(&[2.0, 0.5, 1.0]), &mut seq).unwrap();
        assert_eq!(out.token_id, 1);

        // A negative history logit collapses to zero, overtaking anything
        // still below it.
        let mut seq = seq_with(params, vec![0]);
        let out = sampler.sample_row(&row(&[-1.0, -0.5, -2.0]), &mut seq).unwrap();
        assert_eq!(out.token_id, 0);
    }

    #[test]
    fn test_frequency_penalty_scales_with_count() {
        let sampler = Sampler::new();
        let params = SamplingParams {
            temperature: 0.0,
            frequency_penalty: 1.0,
            ..SamplingParams::default()
        };
        // Token 1 appears twice in history: 5.0 - 2.0 < 3.5.
        let mut seq = seq_with(params, vec![1, 1]);
        let out = sampler.sample_row(&row(&[0.0, 5.0, 3.5]), &mut seq).unwrap();
        assert_eq!(out.token_id, 2);
    }

    #[test]
    fn test_presence_penalty_is_flat() {
        let sampler = Sampler::new();
        let params = SamplingParams {
            temperature: 0.0,
            presence_penalty: 2.0,
            ..SamplingParams::default()
        };
        let mut seq = seq_with(params, vec![1, 1, 1]);
        // 4.0 - 2.0 = 2.0 < 3.0; count does not matter.
        let out = sampler.sample_row(&row(&[0.0, 4.0, 3.0]), &mut seq).unwrap();
        assert_eq!(out.token_id, 2);
    }

    #[test]
    fn test_top_k_excludes_tail() {
        let sampler = Sampler::new();
        let params = SamplingParams {
            temperature: 1.0,
            top_k: 2,
            seed: Some(0),
            ..SamplingParams::default()
        };
        let mut seq = seq_with(params, vec![]);
        for _ in 0..32 {
            let out = sampler.sample_row(&row(&[5.0, 4.0, -50.0, -60.0]), &mut seq).unwrap();
            assert!(out.token_id < 2, "token {} escaped top-2", out.token_id);
        }
    }

    #[test]
    fn test_top_p_keeps_smallest_covering_prefix() {
        let sampler = Sampler::new();
        let params = SamplingParams {
            temperature: 1.0,
            top_p: 0.5,
            seed: Some(0),
            ..SamplingParams::default()
        };
        let mut seq = seq_with(params, vec![]);
        // Token 0 alone carries well over half the mass.
        for _ in 0..32 {
            let out = sampler.sample_row(&row(&[10.0, 1.0, 1.0, 1.0]), &mut seq).unwrap();
            assert_eq!(out.token_id, 0);
        }
    }

    #[test]
    fn test_seeded_sampling_is_deterministic() {
        let sampler = Sampler::new();
        let params = SamplingParams {
            temperature: 0.8,
            seed: Some(42),
            ..SamplingParams::default()
        };
        let logits = [1.0f32, 0.8, 0.6, 0.4, 0.2];

        let mut a = seq_with(params.clone(), vec![]);
        let mut b = seq_with(params, vec![]);
        for _ in 0..16 {
            let x = sampler.sample_row(&row(&logits), &mut a).unwrap();
            let y = sampler.sample_row(&row(&logits), &mut b).unwrap();
            assert_eq!(x.token_id, y.token_id);
            assert_eq!(x.logprob, y.logprob);
        }
    }

    #[test]
    fn test_sampled_logprob_is_negative() {
        let sampler = Sampler::new();
        let params = SamplingParams {
            temperature: 1.0,
            seed: Some(1),
            ..SamplingParams::default()
        };
        let mut seq = seq_with(params, vec![]);
        let out = sampler.sample_row(&row(&[1.0, 1.0, 1.0]), &mut seq).unwrap();
        assert!(out.logprob < 0.0);
    }

    #[test]
    fn test_all_masked_is_an_error() {
        let sampler = Sampler::new();
        let mut bias = HashMap::new();
        for t in 0..3u32 {
            bias.insert(t, f32::NEG_INFINITY);
        }
        let params = SamplingParams {
            temperature: 0.0,
            logit_bias: Some(bias),
            ..SamplingParams::default()
        };
        let mut seq = seq_with(params, vec![0]);
        assert!(sampler.sample_row(&row(&[1.0, 2.0, 3.0]), &mut seq).is_err());
    }
}
