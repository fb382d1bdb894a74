// model.rs
// Description: Transformer model assembly: validated configuration, embedding plus
//              block stack plus vocabulary projection, causal mask construction,
//              greedy and temperature based next token prediction, summed cross
//              entropy loss, and an Adam optimizer keyed by parameter name.
// History:
// - 2026-03-03: Initial model assembly over the layer stack.
// - 2026-03-05: Next token sampling takes a caller supplied seeded RNG.
// - 2026-03-07: Loss moved to an explicit context object like the layers.
// Author: Marcus Schlieper

use std::collections::HashMap;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::layer::{
    BlockContext, Embeddings, EmbeddingsContext, ParameterTensor, PositionalEncoding,
    TransformerBlock,
};
use crate::math;

// Sampling temperatures below this threshold degenerate to greedy argmax.
pub const D_MIN_TEMPERATURE: f64 = 1e-7;

// ----------------------------------------
// TransformerConfig
// ----------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransformerConfig {
    pub i_vocab_size: usize,
    pub i_d_model: usize,
    pub i_num_heads: usize,
    pub i_d_ff: usize,
    pub i_num_layers: usize,
    pub i_max_seq_len: usize,
    pub positional: PositionalEncoding,
}

impl TransformerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.i_vocab_size == 0 {
            return Err("config_vocab_size_must_be_positive".to_string());
        }
        if self.i_d_model == 0
            || self.i_num_heads == 0
            || self.i_d_ff == 0
            || self.i_num_layers == 0
            || self.i_max_seq_len == 0
        {
            return Err(format!(
                "config_dims_must_be_positive: d_model={} num_heads={} d_ff={} num_layers={} max_seq_len={}",
                self.i_d_model, self.i_num_heads, self.i_d_ff, self.i_num_layers, self.i_max_seq_len
            ));
        }
        if self.i_d_model % self.i_num_heads != 0 {
            return Err(format!(
                "config_d_model_not_divisible_by_num_heads: d_model={} num_heads={}",
                self.i_d_model, self.i_num_heads
            ));
        }
        Ok(())
    }
}

// ----------------------------------------
// TransformerModel
// ----------------------------------------

pub struct TransformerModel {
    config: TransformerConfig,
    embeddings: Embeddings,
    v_blocks: Vec<TransformerBlock>,
    tensor_proj: ParameterTensor,
}

pub struct ModelContext {
    emb_ctx: EmbeddingsContext,
    v_block_ctxs: Vec<BlockContext>,
    a_proj_input: Array2<f64>,
}

// Additive mask: 0 on and below the diagonal, -1e9 above. Added to the
// attention scores before softmax.
pub fn causal_mask(i_seq_len: usize) -> Array2<f64> {
    let mut a_mask = Array2::zeros((i_seq_len, i_seq_len));
    for i in 0..i_seq_len {
        for j in (i + 1)..i_seq_len {
            a_mask[[i, j]] = -1e9;
        }
    }
    a_mask
}

fn argmax_row(a_row: ndarray::ArrayView1<'_, f64>) -> usize {
    let mut i_best = 0usize;
    let mut d_best = f64::NEG_INFINITY;
    for (i, &d) in a_row.iter().enumerate() {
        // Strict comparison keeps the first occurrence on ties.
        if d > d_best {
            d_best = d;
            i_best = i;
        }
    }
    i_best
}

impl TransformerModel {
    pub fn new(config: TransformerConfig, rng: &mut StdRng) -> Result<Self, String> {
        config.validate()?;

        let embeddings = Embeddings::new(
            config.i_vocab_size,
            config.i_d_model,
            config.i_max_seq_len,
            config.positional,
            rng,
        )?;

        let mut v_blocks = Vec::with_capacity(config.i_num_layers);
        for i_l in 0..config.i_num_layers {
            v_blocks.push(TransformerBlock::new(
                &format!("block_{}", i_l),
                config.i_d_model,
                config.i_num_heads,
                config.i_d_ff,
                rng,
            )?);
        }

        let d_scale = 1.0 / (config.i_d_model as f64).sqrt();
        let tensor_proj = ParameterTensor::new(
            "output.projection",
            math::random_matrix(config.i_d_model, config.i_vocab_size, d_scale, rng)?,
        );

        Ok(Self {
            config,
            embeddings,
            v_blocks,
            tensor_proj,
        })
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    // Logits for every position: seq_len x vocab_size.
    pub fn forward(&self, v_tokens: &[usize]) -> Result<(Array2<f64>, ModelContext), String> {
        let (mut a_x, emb_ctx) = self.embeddings.forward(v_tokens)?;
        let a_mask = causal_mask(v_tokens.len());

        let mut v_block_ctxs = Vec::with_capacity(self.v_blocks.len());
        for block in &self.v_blocks {
            let (a_next, ctx) = block.forward(&a_x, &a_mask)?;
            a_x = a_next;
            v_block_ctxs.push(ctx);
        }

        let a_logits = math::matmul(&a_x, &self.tensor_proj.a_value)?;

        Ok((
            a_logits,
            ModelContext {
                emb_ctx,
                v_block_ctxs,
                a_proj_input: a_x,
            },
        ))
    }

    // Backpropagates the logit gradient through the projection, the block
    // stack in reverse order, and the embedding scatter. All parameter
    // gradients are left in their ParameterTensor handles; the returned
    // matrix is the seq_len x d_model gradient arriving at the embedding
    // output, for diagnostics.
    pub fn backward(
        &mut self,
        ctx: ModelContext,
        a_grad_logits: &Array2<f64>,
    ) -> Result<Array2<f64>, String> {
        let a_grad_proj = math::matmul(&math::transpose(&ctx.a_proj_input), a_grad_logits)?;
        let mut a_grad_x = math::matmul(a_grad_logits, &math::transpose(&self.tensor_proj.a_value))?;

        self.tensor_proj.assign_grad(a_grad_proj)?;

        for (block, block_ctx) in self
            .v_blocks
            .iter_mut()
            .rev()
            .zip(ctx.v_block_ctxs.into_iter().rev())
        {
            a_grad_x = block.backward(block_ctx, &a_grad_x)?;
        }

        self.embeddings.backward(ctx.emb_ctx, &a_grad_x)?;
        Ok(a_grad_x)
    }

    pub fn predict_next_token(&self, v_tokens: &[usize]) -> Result<usize, String> {
        let (a_logits, _) = self.forward(v_tokens)?;
        Ok(argmax_row(a_logits.row(a_logits.nrows() - 1)))
    }

    pub fn predict_next_token_temperature(
        &self,
        v_tokens: &[usize],
        d_temperature: f64,
        rng: &mut StdRng,
    ) -> Result<usize, String> {
        if d_temperature < 0.0 || !d_temperature.is_finite() {
            return Err(format!("sampling_temperature_invalid: {}", d_temperature));
        }
        if d_temperature < D_MIN_TEMPERATURE {
            return self.predict_next_token(v_tokens);
        }

        let (a_logits, _) = self.forward(v_tokens)?;
        let a_last = a_logits
            .row(a_logits.nrows() - 1)
            .insert_axis(ndarray::Axis(0))
            .to_owned();

        let a_scaled = math::scale_by(&a_last, 1.0 / d_temperature);
        let a_probs = math::softmax_rows(&a_scaled);

        let d_draw: f64 = rng.random();
        let mut d_cum = 0.0;
        for (i, &d_p) in a_probs.row(0).iter().enumerate() {
            d_cum += d_p;
            if d_draw < d_cum {
                return Ok(i);
            }
        }

        // Rounding can leave the accumulated mass a hair below 1.0.
        Ok(a_probs.ncols() - 1)
    }

    pub fn parameters(&self) -> Vec<&ParameterTensor> {
        let mut v = self.embeddings.parameters();
        for block in &self.v_blocks {
            v.extend(block.parameters());
        }
        v.push(&self.tensor_proj);
        v
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut ParameterTensor> {
        let mut v = self.embeddings.parameters_mut();
        for block in &mut self.v_blocks {
            v.extend(block.parameters_mut());
        }
        v.push(&mut self.tensor_proj);
        v
    }

    pub fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }
}

// ----------------------------------------
// CrossEntropyLoss
// ----------------------------------------

pub struct CrossEntropyLoss;

#[derive(Debug)]
pub struct LossContext {
    a_probs: Array2<f64>,
    v_targets: Vec<usize>,
}

impl CrossEntropyLoss {
    // Summed negative log likelihood over all positions. One target id per
    // logit row.
    pub fn compute(
        a_logits: &Array2<f64>,
        v_targets: &[usize],
    ) -> Result<(f64, LossContext), String> {
        if v_targets.len() != a_logits.nrows() {
            return Err(format!(
                "loss_target_count_mismatch: targets={} rows={}",
                v_targets.len(),
                a_logits.nrows()
            ));
        }

        let a_probs = math::softmax_rows(a_logits);

        let mut d_loss = 0.0;
        for (i, &i_target) in v_targets.iter().enumerate() {
            if i_target >= a_probs.ncols() {
                return Err(format!(
                    "loss_target_out_of_range: pos={} id={} vocab_size={}",
                    i, i_target, a_probs.ncols()
                ));
            }
            // Max subtraction bounds every exponent by [-700, 0], so the
            // target probability is at least exp(-700) / n and ln stays
            // finite.
            d_loss -= a_probs[[i, i_target]].ln();
        }

        Ok((
            d_loss,
            LossContext {
                a_probs,
                v_targets: v_targets.to_vec(),
            },
        ))
    }

    // dL/dLogits = probs - one_hot(targets), row by row.
    pub fn backward(ctx: LossContext) -> Array2<f64> {
        let mut a_grad = ctx.a_probs;
        for (i, &i_target) in ctx.v_targets.iter().enumerate() {
            a_grad[[i, i_target]] -= 1.0;
        }
        a_grad
    }
}

// ----------------------------------------
// Adam
// ----------------------------------------

pub struct Adam {
    d_beta1: f64,
    d_beta2: f64,
    d_epsilon: f64,
    i_t: usize,
    // First and second moment estimate per parameter name. Allocated lazily
    // on the first update that names the parameter.
    m_moments: HashMap<String, (Array2<f64>, Array2<f64>)>,
}

impl Adam {
    pub fn new() -> Self {
        Self::with_betas(0.9, 0.999, 1e-8)
    }

    pub fn with_betas(d_beta1: f64, d_beta2: f64, d_epsilon: f64) -> Self {
        Self {
            d_beta1,
            d_beta2,
            d_epsilon,
            i_t: 0,
            m_moments: HashMap::new(),
        }
    }

    pub fn step_count(&self) -> usize {
        self.i_t
    }

    // One optimizer step over the supplied parameters. A subset of the model
    // parameters is fine: state for absent names is untouched and state for
    // new names is created on the spot.
    pub fn step(
        &mut self,
        d_lr: f64,
        v_params: &mut [&mut ParameterTensor],
    ) -> Result<(), String> {
        if !(d_lr > 0.0) || !d_lr.is_finite() {
            return Err(format!("optimizer_learning_rate_invalid: {}", d_lr));
        }

        self.i_t += 1;
        let d_bc1 = 1.0 - self.d_beta1.powi(self.i_t as i32);
        let d_bc2 = 1.0 - self.d_beta2.powi(self.i_t as i32);

        for p in v_params.iter_mut() {
            let (a_m, a_v) = self
                .m_moments
                .entry(p.s_name.clone())
                .or_insert_with(|| {
                    (
                        Array2::zeros(p.a_value.raw_dim()),
                        Array2::zeros(p.a_value.raw_dim()),
                    )
                });

            if a_m.raw_dim() != p.a_value.raw_dim() {
                return Err(format!(
                    "optimizer_state_shape_mismatch: name={} state={}x{} value={}x{}",
                    p.s_name,
                    a_m.nrows(),
                    a_m.ncols(),
                    p.a_value.nrows(),
                    p.a_value.ncols()
                ));
            }

            for ((d_m, d_v), (d_g, d_w)) in a_m
                .iter_mut()
                .zip(a_v.iter_mut())
                .zip(p.a_grad.iter().zip(p.a_value.iter_mut()))
            {
                *d_m = self.d_beta1 * *d_m + (1.0 - self.d_beta1) * d_g;
                *d_v = self.d_beta2 * *d_v + (1.0 - self.d_beta2) * d_g * d_g;

                let d_m_hat = *d_m / d_bc1;
                let d_v_hat = *d_v / d_bc2;

                *d_w -= d_lr * d_m_hat / (d_v_hat.sqrt() + self.d_epsilon);
            }
        }

        Ok(())
    }
}

impl Default for Adam {
    fn default() -> Self {
        Self::new()
    }
}
