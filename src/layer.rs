// layer.rs
// Description: Model layers with manual forward and backward passes: embeddings with
//              sinusoidal or learned positional signal, layer normalization, multi head
//              self attention with causal masking, and the feed forward block, composed
//              into a transformer block.
//
//              Every forward returns an explicit context object holding the cached
//              activations; the matching backward consumes that context by value. There
//              is no hidden cache slot, so forward and backward calls cannot get out of
//              order. Parameter gradients accumulate into named ParameterTensor handles
//              enumerated via parameters_mut for the optimizer.
// History:
// - 2026-03-02: Consolidate layer implementations into layer.rs.
// - 2026-03-04: Replace per-layer cache fields with explicit forward contexts.
// - 2026-03-06: Replace flat parameter vectors with named ParameterTensor handles.
// Author: Marcus Schlieper

use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::math;

// ----------------------------------------
// ParameterTensor
// ----------------------------------------

// A named learnable tensor and its same-shaped gradient. Biases and
// per-feature scale/shift vectors are stored as 1 x d rows.
#[derive(Clone, Debug)]
pub struct ParameterTensor {
    pub s_name: String,
    pub a_value: Array2<f64>,
    pub a_grad: Array2<f64>,
}

impl ParameterTensor {
    pub fn new(s_name: &str, a_value: Array2<f64>) -> Self {
        let a_grad = Array2::zeros(a_value.raw_dim());
        Self {
            s_name: s_name.to_string(),
            a_value,
            a_grad,
        }
    }

    pub fn len(&self) -> usize {
        self.a_value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.a_value.is_empty()
    }

    pub fn zero_grad(&mut self) {
        self.a_grad.fill(0.0);
    }

    pub fn assign_grad(&mut self, a_grad: Array2<f64>) -> Result<(), String> {
        if a_grad.raw_dim() != self.a_value.raw_dim() {
            return Err(format!(
                "grad_shape_mismatch: name={} value={}x{} grad={}x{}",
                self.s_name,
                self.a_value.nrows(),
                self.a_value.ncols(),
                a_grad.nrows(),
                a_grad.ncols()
            ));
        }
        self.a_grad = a_grad;
        Ok(())
    }
}

// ----------------------------------------
// Positional encoding switch
// ----------------------------------------

// One explicit configuration switch. The scheme is never inferred from
// which constructor argument happened to be supplied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionalEncoding {
    Sinusoidal,
    Learned,
}

// ----------------------------------------
// Embeddings
// ----------------------------------------

pub struct Embeddings {
    i_vocab_size: usize,
    i_d_model: usize,
    i_max_seq_len: usize,
    tensor_token: ParameterTensor,
    opt_tensor_pos: Option<ParameterTensor>,
    opt_sin_table: Option<Array2<f64>>,
}

#[derive(Debug)]
pub struct EmbeddingsContext {
    v_tokens: Vec<usize>,
}

impl Embeddings {
    pub fn new(
        i_vocab_size: usize,
        i_d_model: usize,
        i_max_seq_len: usize,
        positional: PositionalEncoding,
        rng: &mut StdRng,
    ) -> Result<Self, String> {
        if i_vocab_size == 0 {
            return Err("vocab_size_must_be_positive".to_string());
        }
        if i_d_model == 0 || i_max_seq_len == 0 {
            return Err(format!(
                "embeddings_dims_must_be_positive: d_model={} max_seq_len={}",
                i_d_model, i_max_seq_len
            ));
        }

        let d_scale = 1.0 / (i_d_model as f64).sqrt();
        let a_token = math::random_matrix(i_vocab_size, i_d_model, d_scale, rng)?;

        let (opt_tensor_pos, opt_sin_table) = match positional {
            PositionalEncoding::Learned => {
                let a_pos = math::random_matrix(i_max_seq_len, i_d_model, d_scale, rng)?;
                (Some(ParameterTensor::new("embeddings.position", a_pos)), None)
            }
            PositionalEncoding::Sinusoidal => {
                (None, Some(Self::sinusoidal_table(i_max_seq_len, i_d_model)))
            }
        };

        Ok(Self {
            i_vocab_size,
            i_d_model,
            i_max_seq_len,
            tensor_token: ParameterTensor::new("embeddings.token", a_token),
            opt_tensor_pos,
            opt_sin_table,
        })
    }

    // Fixed table: sin on even features, cos on odd features, frequency
    // pos / 10000^(j / d_model) per feature j.
    fn sinusoidal_table(i_max_seq_len: usize, i_d_model: usize) -> Array2<f64> {
        let mut a_table = Array2::zeros((i_max_seq_len, i_d_model));

        for i_pos in 0..i_max_seq_len {
            for j in 0..i_d_model {
                let d_freq = (i_pos as f64) / 10000f64.powf((j as f64) / (i_d_model as f64));
                a_table[[i_pos, j]] = if j % 2 == 0 { d_freq.sin() } else { d_freq.cos() };
            }
        }

        a_table
    }

    fn positional_row(&self, i_pos: usize) -> ndarray::ArrayView1<'_, f64> {
        match (&self.opt_tensor_pos, &self.opt_sin_table) {
            (Some(t), _) => t.a_value.row(i_pos),
            (None, Some(a)) => a.row(i_pos),
            // Constructor guarantees exactly one scheme is active.
            (None, None) => unreachable!("embeddings_without_positional_scheme"),
        }
    }

    pub fn forward(&self, v_tokens: &[usize]) -> Result<(Array2<f64>, EmbeddingsContext), String> {
        if v_tokens.is_empty() {
            return Err("token_sequence_empty".to_string());
        }
        if v_tokens.len() > self.i_max_seq_len {
            return Err(format!(
                "token_sequence_too_long: len={} max_seq_len={}",
                v_tokens.len(),
                self.i_max_seq_len
            ));
        }

        let mut a_out = Array2::zeros((v_tokens.len(), self.i_d_model));

        for (i_pos, &i_id) in v_tokens.iter().enumerate() {
            if i_id >= self.i_vocab_size {
                return Err(format!(
                    "token_id_out_of_range: pos={} id={} vocab_size={}",
                    i_pos, i_id, self.i_vocab_size
                ));
            }

            let a_tok_row = self.tensor_token.a_value.row(i_id);
            let a_pos_row = self.positional_row(i_pos);

            let mut a_dst = a_out.row_mut(i_pos);
            for j in 0..self.i_d_model {
                a_dst[j] = a_tok_row[j] + a_pos_row[j];
            }
        }

        Ok((
            a_out,
            EmbeddingsContext {
                v_tokens: v_tokens.to_vec(),
            },
        ))
    }

    // Scatter-accumulate: every occurrence of a token id adds into the same
    // embedding row, it does not overwrite.
    pub fn backward(
        &mut self,
        ctx: EmbeddingsContext,
        a_grads: &Array2<f64>,
    ) -> Result<(), String> {
        if a_grads.nrows() != ctx.v_tokens.len() || a_grads.ncols() != self.i_d_model {
            return Err(format!(
                "embeddings_backward_shape_mismatch: grads={}x{} expected={}x{}",
                a_grads.nrows(),
                a_grads.ncols(),
                ctx.v_tokens.len(),
                self.i_d_model
            ));
        }

        self.tensor_token.zero_grad();
        if let Some(t) = self.opt_tensor_pos.as_mut() {
            t.zero_grad();
        }

        for (i_pos, &i_id) in ctx.v_tokens.iter().enumerate() {
            if i_id >= self.i_vocab_size {
                return Err(format!(
                    "token_id_out_of_range: pos={} id={} vocab_size={}",
                    i_pos, i_id, self.i_vocab_size
                ));
            }

            let a_g_row = a_grads.row(i_pos);

            let mut a_tok_grad = self.tensor_token.a_grad.row_mut(i_id);
            for j in 0..self.i_d_model {
                a_tok_grad[j] += a_g_row[j];
            }

            if let Some(t) = self.opt_tensor_pos.as_mut() {
                let mut a_pos_grad = t.a_grad.row_mut(i_pos);
                for j in 0..self.i_d_model {
                    a_pos_grad[j] += a_g_row[j];
                }
            }
        }

        Ok(())
    }

    pub fn parameters(&self) -> Vec<&ParameterTensor> {
        let mut v = vec![&self.tensor_token];
        if let Some(t) = self.opt_tensor_pos.as_ref() {
            v.push(t);
        }
        v
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut ParameterTensor> {
        let mut v = vec![&mut self.tensor_token];
        if let Some(t) = self.opt_tensor_pos.as_mut() {
            v.push(t);
        }
        v
    }
}

// ----------------------------------------
// LayerNorm
// ----------------------------------------

pub struct LayerNorm {
    d_epsilon: f64,
    tensor_gamma: ParameterTensor,
    tensor_beta: ParameterTensor,
}

pub struct LayerNormContext {
    a_inv_std: Array2<f64>,
    a_norm: Array2<f64>,
}

impl LayerNorm {
    pub fn new(s_prefix: &str, i_d_model: usize) -> Result<Self, String> {
        if i_d_model == 0 {
            return Err("layer_norm_d_model_must_be_positive".to_string());
        }

        Ok(Self {
            d_epsilon: 1e-5,
            tensor_gamma: ParameterTensor::new(
                &format!("{}.gamma", s_prefix),
                Array2::ones((1, i_d_model)),
            ),
            tensor_beta: ParameterTensor::new(
                &format!("{}.beta", s_prefix),
                Array2::zeros((1, i_d_model)),
            ),
        })
    }

    pub fn forward(&self, a_input: &Array2<f64>) -> Result<(Array2<f64>, LayerNormContext), String> {
        if a_input.ncols() != self.tensor_gamma.a_value.ncols() {
            return Err(format!(
                "layer_norm_dim_mismatch: input_cols={} d_model={}",
                a_input.ncols(),
                self.tensor_gamma.a_value.ncols()
            ));
        }

        let a_mean = a_input
            .mean_axis(Axis(1))
            .ok_or_else(|| "layer_norm_empty_input".to_string())?
            .insert_axis(Axis(1));

        let a_centered = a_input - &a_mean;
        let a_var = a_centered
            .mapv(|x| x * x)
            .mean_axis(Axis(1))
            .ok_or_else(|| "layer_norm_empty_input".to_string())?
            .insert_axis(Axis(1));

        // Epsilon guards the zero-variance (constant) row.
        let a_inv_std = a_var.mapv(|v| 1.0 / (v + self.d_epsilon).sqrt());
        let a_norm = &a_centered * &a_inv_std;

        let a_out = &(&a_norm * &self.tensor_gamma.a_value) + &self.tensor_beta.a_value;

        Ok((a_out, LayerNormContext { a_inv_std, a_norm }))
    }

    // Exact analytic gradient through the normalization statistics:
    // dx = inv_std * (g - mean(g) - norm * mean(g * norm)) per row, where
    // g is the gradient w.r.t. the normalized value.
    pub fn backward(
        &mut self,
        ctx: LayerNormContext,
        a_grads: &Array2<f64>,
    ) -> Result<Array2<f64>, String> {
        if a_grads.raw_dim() != ctx.a_norm.raw_dim() {
            return Err(format!(
                "layer_norm_backward_shape_mismatch: grads={}x{} norm={}x{}",
                a_grads.nrows(),
                a_grads.ncols(),
                ctx.a_norm.nrows(),
                ctx.a_norm.ncols()
            ));
        }

        let a_grad_gamma = math::column_sums(&(a_grads * &ctx.a_norm));
        let a_grad_beta = math::column_sums(a_grads);

        let a_grad_norm = a_grads * &self.tensor_gamma.a_value;

        let a_mean_g = a_grad_norm
            .mean_axis(Axis(1))
            .ok_or_else(|| "layer_norm_empty_grads".to_string())?
            .insert_axis(Axis(1));
        let a_mean_gn = (&a_grad_norm * &ctx.a_norm)
            .mean_axis(Axis(1))
            .ok_or_else(|| "layer_norm_empty_grads".to_string())?
            .insert_axis(Axis(1));

        let a_centered = &a_grad_norm - &a_mean_g;
        let a_proj = &ctx.a_norm * &a_mean_gn;
        let a_grad_input = (&a_centered - &a_proj) * &ctx.a_inv_std;

        self.tensor_gamma.assign_grad(a_grad_gamma)?;
        self.tensor_beta.assign_grad(a_grad_beta)?;

        Ok(a_grad_input)
    }

    pub fn parameters(&self) -> Vec<&ParameterTensor> {
        vec![&self.tensor_gamma, &self.tensor_beta]
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut ParameterTensor> {
        vec![&mut self.tensor_gamma, &mut self.tensor_beta]
    }
}

// ----------------------------------------
// FeedForward
// ----------------------------------------

pub struct FeedForward {
    tensor_w1: ParameterTensor,
    tensor_b1: ParameterTensor,
    tensor_w2: ParameterTensor,
    tensor_b2: ParameterTensor,
}

pub struct FeedForwardContext {
    a_input: Array2<f64>,
    a_hidden_pre: Array2<f64>,
    a_hidden_post: Array2<f64>,
}

impl FeedForward {
    pub fn new(
        s_prefix: &str,
        i_d_model: usize,
        i_d_ff: usize,
        rng: &mut StdRng,
    ) -> Result<Self, String> {
        if i_d_model == 0 || i_d_ff == 0 {
            return Err(format!(
                "feed_forward_dims_must_be_positive: d_model={} d_ff={}",
                i_d_model, i_d_ff
            ));
        }

        let d_scale_w1 = 1.0 / (i_d_model as f64).sqrt();
        let d_scale_w2 = 1.0 / (i_d_ff as f64).sqrt();

        Ok(Self {
            tensor_w1: ParameterTensor::new(
                &format!("{}.w1", s_prefix),
                math::random_matrix(i_d_model, i_d_ff, d_scale_w1, rng)?,
            ),
            tensor_b1: ParameterTensor::new(
                &format!("{}.b1", s_prefix),
                Array2::zeros((1, i_d_ff)),
            ),
            tensor_w2: ParameterTensor::new(
                &format!("{}.w2", s_prefix),
                math::random_matrix(i_d_ff, i_d_model, d_scale_w2, rng)?,
            ),
            tensor_b2: ParameterTensor::new(
                &format!("{}.b2", s_prefix),
                Array2::zeros((1, i_d_model)),
            ),
        })
    }

    pub fn forward(
        &self,
        a_input: &Array2<f64>,
    ) -> Result<(Array2<f64>, FeedForwardContext), String> {
        let a_hidden_pre = &math::matmul(a_input, &self.tensor_w1.a_value)? + &self.tensor_b1.a_value;
        let a_hidden_post = math::relu(&a_hidden_pre);
        let a_out = &math::matmul(&a_hidden_post, &self.tensor_w2.a_value)? + &self.tensor_b2.a_value;

        Ok((
            a_out,
            FeedForwardContext {
                a_input: a_input.clone(),
                a_hidden_pre,
                a_hidden_post,
            },
        ))
    }

    pub fn backward(
        &mut self,
        ctx: FeedForwardContext,
        a_grads: &Array2<f64>,
    ) -> Result<Array2<f64>, String> {
        let a_grad_w2 = math::matmul(&math::transpose(&ctx.a_hidden_post), a_grads)?;
        let a_grad_b2 = math::column_sums(a_grads);

        let a_grad_hidden_post = math::matmul(a_grads, &math::transpose(&self.tensor_w2.a_value))?;
        let a_grad_hidden_pre = math::relu_backward(&ctx.a_hidden_pre, &a_grad_hidden_post)?;

        let a_grad_w1 = math::matmul(&math::transpose(&ctx.a_input), &a_grad_hidden_pre)?;
        let a_grad_b1 = math::column_sums(&a_grad_hidden_pre);

        let a_grad_input = math::matmul(&a_grad_hidden_pre, &math::transpose(&self.tensor_w1.a_value))?;

        self.tensor_w2.assign_grad(a_grad_w2)?;
        self.tensor_b2.assign_grad(a_grad_b2)?;
        self.tensor_w1.assign_grad(a_grad_w1)?;
        self.tensor_b1.assign_grad(a_grad_b1)?;

        Ok(a_grad_input)
    }

    pub fn parameters(&self) -> Vec<&ParameterTensor> {
        vec![
            &self.tensor_w1,
            &self.tensor_b1,
            &self.tensor_w2,
            &self.tensor_b2,
        ]
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut ParameterTensor> {
        vec![
            &mut self.tensor_w1,
            &mut self.tensor_b1,
            &mut self.tensor_w2,
            &mut self.tensor_b2,
        ]
    }
}

// ----------------------------------------
// MultiHeadSelfAttention (causal)
// ----------------------------------------

#[derive(Debug)]
pub struct MultiHeadSelfAttention {
    i_d_model: usize,
    i_num_heads: usize,
    i_head_dim: usize,

    tensor_w_q: ParameterTensor,
    tensor_w_k: ParameterTensor,
    tensor_w_v: ParameterTensor,
    tensor_w_o: ParameterTensor,
}

pub struct AttentionContext {
    a_input: Array2<f64>,
    a_q_all: Array2<f64>,
    a_k_all: Array2<f64>,
    a_v_all: Array2<f64>,
    v_weights: Vec<Array2<f64>>,
    a_concat: Array2<f64>,
    opt_mask: Option<Array2<f64>>,
}

impl AttentionContext {
    // Per-head attention weights, exposed for diagnostics and tests.
    pub fn head_weights(&self) -> &[Array2<f64>] {
        &self.v_weights
    }
}

impl MultiHeadSelfAttention {
    pub fn new(
        s_prefix: &str,
        i_d_model: usize,
        i_num_heads: usize,
        rng: &mut StdRng,
    ) -> Result<Self, String> {
        if i_d_model == 0 {
            return Err("attention_d_model_must_be_positive".to_string());
        }
        if i_num_heads == 0 {
            return Err("attention_num_heads_must_be_positive".to_string());
        }
        if i_d_model % i_num_heads != 0 {
            return Err(format!(
                "attention_d_model_not_divisible_by_num_heads: d_model={} num_heads={}",
                i_d_model, i_num_heads
            ));
        }

        let i_head_dim = i_d_model / i_num_heads;
        let d_scale = 1.0 / (i_d_model as f64).sqrt();

        Ok(Self {
            i_d_model,
            i_num_heads,
            i_head_dim,
            tensor_w_q: ParameterTensor::new(
                &format!("{}.w_q", s_prefix),
                math::random_matrix(i_d_model, i_d_model, d_scale, rng)?,
            ),
            tensor_w_k: ParameterTensor::new(
                &format!("{}.w_k", s_prefix),
                math::random_matrix(i_d_model, i_d_model, d_scale, rng)?,
            ),
            tensor_w_v: ParameterTensor::new(
                &format!("{}.w_v", s_prefix),
                math::random_matrix(i_d_model, i_d_model, d_scale, rng)?,
            ),
            tensor_w_o: ParameterTensor::new(
                &format!("{}.w_o", s_prefix),
                math::random_matrix(i_d_model, i_d_model, d_scale, rng)?,
            ),
        })
    }

    fn softmax_backward(a_softmax: &Array2<f64>, a_grad_out: &Array2<f64>) -> Array2<f64> {
        let mut a_grad_in = a_softmax.clone();
        for i in 0..a_softmax.nrows() {
            let a_row = a_softmax.row(i);
            let a_grow = a_grad_out.row(i);

            let d_dot: f64 = a_row.iter().zip(a_grow.iter()).map(|(&y, &dy)| y * dy).sum();

            for j in 0..a_softmax.ncols() {
                a_grad_in[[i, j]] = a_softmax[[i, j]] * (a_grad_out[[i, j]] - d_dot);
            }
        }
        a_grad_in
    }

    // Contiguous feature slices of width head_dim, in head order.
    fn split_heads(&self, a_x: &Array2<f64>) -> Result<Vec<Array2<f64>>, String> {
        if a_x.ncols() != self.i_d_model {
            return Err(format!(
                "attention_split_heads_dim_mismatch: cols={} d_model={}",
                a_x.ncols(),
                self.i_d_model
            ));
        }

        let mut v_heads: Vec<Array2<f64>> = Vec::with_capacity(self.i_num_heads);
        for i_h in 0..self.i_num_heads {
            let i_start = i_h * self.i_head_dim;
            let i_end = i_start + self.i_head_dim;
            v_heads.push(a_x.slice(ndarray::s![.., i_start..i_end]).to_owned());
        }

        Ok(v_heads)
    }

    fn concat_heads(&self, v_heads: &[Array2<f64>]) -> Result<Array2<f64>, String> {
        if v_heads.len() != self.i_num_heads {
            return Err(format!(
                "attention_concat_heads_count_mismatch: got={} expected={}",
                v_heads.len(),
                self.i_num_heads
            ));
        }

        let i_seq_len = v_heads[0].nrows();
        let mut a_out = Array2::zeros((i_seq_len, self.i_d_model));

        for (i_h, a_h) in v_heads.iter().enumerate() {
            if a_h.nrows() != i_seq_len || a_h.ncols() != self.i_head_dim {
                return Err(format!(
                    "attention_concat_heads_shape_mismatch: head={} shape={}x{}",
                    i_h,
                    a_h.nrows(),
                    a_h.ncols()
                ));
            }

            let i_start = i_h * self.i_head_dim;
            let i_end = i_start + self.i_head_dim;
            a_out
                .slice_mut(ndarray::s![.., i_start..i_end])
                .assign(a_h);
        }

        Ok(a_out)
    }

    pub fn forward(
        &self,
        a_input: &Array2<f64>,
        opt_mask: Option<&Array2<f64>>,
    ) -> Result<(Array2<f64>, AttentionContext), String> {
        if a_input.ncols() != self.i_d_model {
            return Err(format!(
                "attention_input_dim_mismatch: cols={} d_model={}",
                a_input.ncols(),
                self.i_d_model
            ));
        }

        let i_seq_len = a_input.nrows();
        if let Some(a_mask) = opt_mask {
            if a_mask.nrows() != i_seq_len || a_mask.ncols() != i_seq_len {
                return Err(format!(
                    "attention_mask_shape_mismatch: mask={}x{} seq_len={}",
                    a_mask.nrows(),
                    a_mask.ncols(),
                    i_seq_len
                ));
            }
        }

        let a_q_all = math::matmul(a_input, &self.tensor_w_q.a_value)?;
        let a_k_all = math::matmul(a_input, &self.tensor_w_k.a_value)?;
        let a_v_all = math::matmul(a_input, &self.tensor_w_v.a_value)?;

        let v_q = self.split_heads(&a_q_all)?;
        let v_k = self.split_heads(&a_k_all)?;
        let v_v = self.split_heads(&a_v_all)?;

        let d_scale = (self.i_head_dim as f64).sqrt();

        let mut v_head_out: Vec<Array2<f64>> = Vec::with_capacity(self.i_num_heads);
        let mut v_weights: Vec<Array2<f64>> = Vec::with_capacity(self.i_num_heads);

        for i_h in 0..self.i_num_heads {
            let mut a_scores =
                math::scale_by(&math::matmul(&v_q[i_h], &math::transpose(&v_k[i_h]))?, 1.0 / d_scale);

            if let Some(a_mask) = opt_mask {
                a_scores = math::add(&a_scores, a_mask)?;
            }

            let a_w = math::softmax_rows(&a_scores);
            let a_h_out = math::matmul(&a_w, &v_v[i_h])?;

            v_weights.push(a_w);
            v_head_out.push(a_h_out);
        }

        let a_concat = self.concat_heads(&v_head_out)?;
        let a_out = math::matmul(&a_concat, &self.tensor_w_o.a_value)?;

        Ok((
            a_out,
            AttentionContext {
                a_input: a_input.clone(),
                a_q_all,
                a_k_all,
                a_v_all,
                v_weights,
                a_concat,
                opt_mask: opt_mask.cloned(),
            },
        ))
    }

    // Ordering here mirrors the forward pass in reverse: output projection,
    // head split, value path, softmax Jacobian, mask zeroing, score scaling,
    // query/key paths, head merge, input projections.
    pub fn backward(
        &mut self,
        ctx: AttentionContext,
        a_grads: &Array2<f64>,
    ) -> Result<Array2<f64>, String> {
        if a_grads.raw_dim() != ctx.a_input.raw_dim() {
            return Err(format!(
                "attention_backward_shape_mismatch: grads={}x{} input={}x{}",
                a_grads.nrows(),
                a_grads.ncols(),
                ctx.a_input.nrows(),
                ctx.a_input.ncols()
            ));
        }

        let a_grad_w_o = math::matmul(&math::transpose(&ctx.a_concat), a_grads)?;
        let a_grad_concat = math::matmul(a_grads, &math::transpose(&self.tensor_w_o.a_value))?;

        let v_grad_head_out = self.split_heads(&a_grad_concat)?;
        let v_q = self.split_heads(&ctx.a_q_all)?;
        let v_k = self.split_heads(&ctx.a_k_all)?;
        let v_v = self.split_heads(&ctx.a_v_all)?;

        let d_scale = (self.i_head_dim as f64).sqrt();

        let mut v_grad_q: Vec<Array2<f64>> = Vec::with_capacity(self.i_num_heads);
        let mut v_grad_k: Vec<Array2<f64>> = Vec::with_capacity(self.i_num_heads);
        let mut v_grad_v: Vec<Array2<f64>> = Vec::with_capacity(self.i_num_heads);

        for i_h in 0..self.i_num_heads {
            let a_w = &ctx.v_weights[i_h];
            let a_grad_h_out = &v_grad_head_out[i_h];

            let a_grad_w = math::matmul(a_grad_h_out, &math::transpose(&v_v[i_h]))?;
            let a_grad_v_h = math::matmul(&math::transpose(a_w), a_grad_h_out)?;

            let mut a_grad_scores = Self::softmax_backward(a_w, &a_grad_w);

            if let Some(a_mask) = ctx.opt_mask.as_ref() {
                for i in 0..a_grad_scores.nrows() {
                    for j in 0..a_grad_scores.ncols() {
                        if a_mask[[i, j]] < 0.0 {
                            a_grad_scores[[i, j]] = 0.0;
                        }
                    }
                }
            }

            a_grad_scores = math::scale_by(&a_grad_scores, 1.0 / d_scale);

            let a_grad_q_h = math::matmul(&a_grad_scores, &v_k[i_h])?;
            let a_grad_k_h = math::matmul(&math::transpose(&a_grad_scores), &v_q[i_h])?;

            v_grad_q.push(a_grad_q_h);
            v_grad_k.push(a_grad_k_h);
            v_grad_v.push(a_grad_v_h);
        }

        let a_grad_q_all = self.concat_heads(&v_grad_q)?;
        let a_grad_k_all = self.concat_heads(&v_grad_k)?;
        let a_grad_v_all = self.concat_heads(&v_grad_v)?;

        let a_x_t = math::transpose(&ctx.a_input);
        let a_grad_w_q = math::matmul(&a_x_t, &a_grad_q_all)?;
        let a_grad_w_k = math::matmul(&a_x_t, &a_grad_k_all)?;
        let a_grad_w_v = math::matmul(&a_x_t, &a_grad_v_all)?;

        let a_grad_x_q = math::matmul(&a_grad_q_all, &math::transpose(&self.tensor_w_q.a_value))?;
        let a_grad_x_k = math::matmul(&a_grad_k_all, &math::transpose(&self.tensor_w_k.a_value))?;
        let a_grad_x_v = math::matmul(&a_grad_v_all, &math::transpose(&self.tensor_w_v.a_value))?;

        let a_grad_input = math::add(&math::add(&a_grad_x_q, &a_grad_x_k)?, &a_grad_x_v)?;

        self.tensor_w_o.assign_grad(a_grad_w_o)?;
        self.tensor_w_q.assign_grad(a_grad_w_q)?;
        self.tensor_w_k.assign_grad(a_grad_w_k)?;
        self.tensor_w_v.assign_grad(a_grad_w_v)?;

        Ok(a_grad_input)
    }

    pub fn parameters(&self) -> Vec<&ParameterTensor> {
        vec![
            &self.tensor_w_q,
            &self.tensor_w_k,
            &self.tensor_w_v,
            &self.tensor_w_o,
        ]
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut ParameterTensor> {
        vec![
            &mut self.tensor_w_q,
            &mut self.tensor_w_k,
            &mut self.tensor_w_v,
            &mut self.tensor_w_o,
        ]
    }
}

// ----------------------------------------
// TransformerBlock (attention + residual + norm, feed forward + residual + norm)
// ----------------------------------------

pub struct TransformerBlock {
    attention: MultiHeadSelfAttention,
    norm1: LayerNorm,
    feed_forward: FeedForward,
    norm2: LayerNorm,
}

pub struct BlockContext {
    attn_ctx: AttentionContext,
    norm1_ctx: LayerNormContext,
    ffn_ctx: FeedForwardContext,
    norm2_ctx: LayerNormContext,
}

impl TransformerBlock {
    pub fn new(
        s_prefix: &str,
        i_d_model: usize,
        i_num_heads: usize,
        i_d_ff: usize,
        rng: &mut StdRng,
    ) -> Result<Self, String> {
        Ok(Self {
            attention: MultiHeadSelfAttention::new(
                &format!("{}.attention", s_prefix),
                i_d_model,
                i_num_heads,
                rng,
            )?,
            norm1: LayerNorm::new(&format!("{}.norm1", s_prefix), i_d_model)?,
            feed_forward: FeedForward::new(&format!("{}.ffn", s_prefix), i_d_model, i_d_ff, rng)?,
            norm2: LayerNorm::new(&format!("{}.norm2", s_prefix), i_d_model)?,
        })
    }

    pub fn forward(
        &self,
        a_input: &Array2<f64>,
        a_mask: &Array2<f64>,
    ) -> Result<(Array2<f64>, BlockContext), String> {
        let (a_attn, attn_ctx) = self.attention.forward(a_input, Some(a_mask))?;
        let a_sum1 = math::add(a_input, &a_attn)?;
        let (a_x2, norm1_ctx) = self.norm1.forward(&a_sum1)?;

        let (a_ff, ffn_ctx) = self.feed_forward.forward(&a_x2)?;
        let a_sum2 = math::add(&a_x2, &a_ff)?;
        let (a_x3, norm2_ctx) = self.norm2.forward(&a_sum2)?;

        Ok((
            a_x3,
            BlockContext {
                attn_ctx,
                norm1_ctx,
                ffn_ctx,
                norm2_ctx,
            },
        ))
    }

    // Each pre-norm sum gradient feeds identically into the sublayer path
    // and the residual path; the two contributions are summed.
    pub fn backward(
        &mut self,
        ctx: BlockContext,
        a_grads: &Array2<f64>,
    ) -> Result<Array2<f64>, String> {
        let a_grad_sum2 = self.norm2.backward(ctx.norm2_ctx, a_grads)?;

        let a_grad_x2_ff = self.feed_forward.backward(ctx.ffn_ctx, &a_grad_sum2)?;
        let a_grad_x2 = math::add(&a_grad_x2_ff, &a_grad_sum2)?;

        let a_grad_sum1 = self.norm1.backward(ctx.norm1_ctx, &a_grad_x2)?;

        let a_grad_x_attn = self.attention.backward(ctx.attn_ctx, &a_grad_sum1)?;
        math::add(&a_grad_x_attn, &a_grad_sum1)
    }

    pub fn parameters(&self) -> Vec<&ParameterTensor> {
        let mut v = self.attention.parameters();
        v.extend(self.norm1.parameters());
        v.extend(self.feed_forward.parameters());
        v.extend(self.norm2.parameters());
        v
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut ParameterTensor> {
        let mut v = self.attention.parameters_mut();
        v.extend(self.norm1.parameters_mut());
        v.extend(self.feed_forward.parameters_mut());
        v.extend(self.norm2.parameters_mut());
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    const D_FD_STEP: f64 = 1e-5;

    fn assert_close(d_analytic: f64, d_numeric: f64, s_what: &str) {
        let d_tol = 1e-6 + 1e-3 * d_analytic.abs().max(d_numeric.abs());
        assert!(
            (d_analytic - d_numeric).abs() <= d_tol,
            "{}: analytic={} numeric={}",
            s_what,
            d_analytic,
            d_numeric
        );
    }

    fn causal_mask(i_len: usize) -> Array2<f64> {
        let mut a_mask = Array2::zeros((i_len, i_len));
        for i in 0..i_len {
            for j in (i + 1)..i_len {
                a_mask[[i, j]] = -1e9;
            }
        }
        a_mask
    }

    // Scalar loss: sum(out * weights), so dL/dOut = weights.
    fn weighted_sum(a_out: &Array2<f64>, a_w: &Array2<f64>) -> f64 {
        (a_out * a_w).sum()
    }

    #[test]
    fn layer_norm_gradient_check() {
        let mut rng = StdRng::seed_from_u64(42);
        let a_x = math::random_matrix(3, 6, 1.0, &mut rng).unwrap();
        let a_lw = math::random_matrix(3, 6, 1.0, &mut rng).unwrap();

        let mut ln = LayerNorm::new("test", 6).unwrap();
        // Non-trivial affine parameters.
        let a_gamma = math::random_matrix(1, 6, 0.5, &mut rng).unwrap();
        ln.tensor_gamma.a_value = &ln.tensor_gamma.a_value + &a_gamma;
        ln.tensor_beta.a_value = math::random_matrix(1, 6, 0.5, &mut rng).unwrap();

        let (_, ctx) = ln.forward(&a_x).unwrap();
        let a_grad_x = ln.backward(ctx, &a_lw).unwrap();

        // Input gradient.
        for &(i, j) in [(0usize, 0usize), (1, 3), (2, 5)].iter() {
            let mut a_plus = a_x.clone();
            a_plus[[i, j]] += D_FD_STEP;
            let mut a_minus = a_x.clone();
            a_minus[[i, j]] -= D_FD_STEP;

            let d_lp = weighted_sum(&ln.forward(&a_plus).unwrap().0, &a_lw);
            let d_lm = weighted_sum(&ln.forward(&a_minus).unwrap().0, &a_lw);
            let d_numeric = (d_lp - d_lm) / (2.0 * D_FD_STEP);

            assert_close(a_grad_x[[i, j]], d_numeric, "layer_norm_grad_input");
        }

        // Gamma and beta gradients.
        for j in [0usize, 2, 5] {
            let d_analytic_gamma = ln.tensor_gamma.a_grad[[0, j]];
            let d_analytic_beta = ln.tensor_beta.a_grad[[0, j]];

            ln.tensor_gamma.a_value[[0, j]] += D_FD_STEP;
            let d_lp = weighted_sum(&ln.forward(&a_x).unwrap().0, &a_lw);
            ln.tensor_gamma.a_value[[0, j]] -= 2.0 * D_FD_STEP;
            let d_lm = weighted_sum(&ln.forward(&a_x).unwrap().0, &a_lw);
            ln.tensor_gamma.a_value[[0, j]] += D_FD_STEP;
            assert_close(
                d_analytic_gamma,
                (d_lp - d_lm) / (2.0 * D_FD_STEP),
                "layer_norm_grad_gamma",
            );

            ln.tensor_beta.a_value[[0, j]] += D_FD_STEP;
            let d_lp = weighted_sum(&ln.forward(&a_x).unwrap().0, &a_lw);
            ln.tensor_beta.a_value[[0, j]] -= 2.0 * D_FD_STEP;
            let d_lm = weighted_sum(&ln.forward(&a_x).unwrap().0, &a_lw);
            ln.tensor_beta.a_value[[0, j]] += D_FD_STEP;
            assert_close(
                d_analytic_beta,
                (d_lp - d_lm) / (2.0 * D_FD_STEP),
                "layer_norm_grad_beta",
            );
        }
    }

    #[test]
    fn layer_norm_constant_row_is_guarded() {
        let ln = LayerNorm::new("test", 4).unwrap();
        let a_x = Array2::from_elem((2, 4), 3.5);
        let (a_out, _) = ln.forward(&a_x).unwrap();
        for &d in a_out.iter() {
            assert!(d.is_finite());
        }
    }

    #[test]
    fn feed_forward_gradient_check() {
        let mut rng = StdRng::seed_from_u64(43);
        let a_x = math::random_matrix(3, 4, 1.0, &mut rng).unwrap();
        let a_lw = math::random_matrix(3, 4, 1.0, &mut rng).unwrap();

        let mut ff = FeedForward::new("test", 4, 8, &mut rng).unwrap();

        let (_, ctx) = ff.forward(&a_x).unwrap();
        let a_grad_x = ff.backward(ctx, &a_lw).unwrap();

        for &(i, j) in [(0usize, 0usize), (1, 2), (2, 3)].iter() {
            let mut a_plus = a_x.clone();
            a_plus[[i, j]] += D_FD_STEP;
            let mut a_minus = a_x.clone();
            a_minus[[i, j]] -= D_FD_STEP;

            let d_lp = weighted_sum(&ff.forward(&a_plus).unwrap().0, &a_lw);
            let d_lm = weighted_sum(&ff.forward(&a_minus).unwrap().0, &a_lw);
            assert_close(
                a_grad_x[[i, j]],
                (d_lp - d_lm) / (2.0 * D_FD_STEP),
                "feed_forward_grad_input",
            );
        }

        // Weight and bias gradients via the parameter handles.
        for &(i, j) in [(0usize, 1usize), (3, 6)].iter() {
            let d_analytic = ff.tensor_w1.a_grad[[i, j]];
            ff.tensor_w1.a_value[[i, j]] += D_FD_STEP;
            let d_lp = weighted_sum(&ff.forward(&a_x).unwrap().0, &a_lw);
            ff.tensor_w1.a_value[[i, j]] -= 2.0 * D_FD_STEP;
            let d_lm = weighted_sum(&ff.forward(&a_x).unwrap().0, &a_lw);
            ff.tensor_w1.a_value[[i, j]] += D_FD_STEP;
            assert_close(
                d_analytic,
                (d_lp - d_lm) / (2.0 * D_FD_STEP),
                "feed_forward_grad_w1",
            );
        }

        let d_analytic_b2 = ff.tensor_b2.a_grad[[0, 1]];
        ff.tensor_b2.a_value[[0, 1]] += D_FD_STEP;
        let d_lp = weighted_sum(&ff.forward(&a_x).unwrap().0, &a_lw);
        ff.tensor_b2.a_value[[0, 1]] -= 2.0 * D_FD_STEP;
        let d_lm = weighted_sum(&ff.forward(&a_x).unwrap().0, &a_lw);
        ff.tensor_b2.a_value[[0, 1]] += D_FD_STEP;
        assert_close(
            d_analytic_b2,
            (d_lp - d_lm) / (2.0 * D_FD_STEP),
            "feed_forward_grad_b2",
        );
    }

    #[test]
    fn attention_gradient_check() {
        let mut rng = StdRng::seed_from_u64(44);
        let i_len = 4;
        let a_x = math::random_matrix(i_len, 8, 1.0, &mut rng).unwrap();
        let a_lw = math::random_matrix(i_len, 8, 1.0, &mut rng).unwrap();
        let a_mask = causal_mask(i_len);

        let mut attn = MultiHeadSelfAttention::new("test", 8, 2, &mut rng).unwrap();

        let (_, ctx) = attn.forward(&a_x, Some(&a_mask)).unwrap();
        let a_grad_x = attn.backward(ctx, &a_lw).unwrap();

        for &(i, j) in [(0usize, 0usize), (1, 3), (2, 7), (3, 4)].iter() {
            let mut a_plus = a_x.clone();
            a_plus[[i, j]] += D_FD_STEP;
            let mut a_minus = a_x.clone();
            a_minus[[i, j]] -= D_FD_STEP;

            let d_lp = weighted_sum(&attn.forward(&a_plus, Some(&a_mask)).unwrap().0, &a_lw);
            let d_lm = weighted_sum(&attn.forward(&a_minus, Some(&a_mask)).unwrap().0, &a_lw);
            assert_close(
                a_grad_x[[i, j]],
                (d_lp - d_lm) / (2.0 * D_FD_STEP),
                "attention_grad_input",
            );
        }

        // Projection weight gradients.
        for &(i, j) in [(0usize, 0usize), (4, 7)].iter() {
            let d_analytic = attn.tensor_w_q.a_grad[[i, j]];
            attn.tensor_w_q.a_value[[i, j]] += D_FD_STEP;
            let d_lp = weighted_sum(&attn.forward(&a_x, Some(&a_mask)).unwrap().0, &a_lw);
            attn.tensor_w_q.a_value[[i, j]] -= 2.0 * D_FD_STEP;
            let d_lm = weighted_sum(&attn.forward(&a_x, Some(&a_mask)).unwrap().0, &a_lw);
            attn.tensor_w_q.a_value[[i, j]] += D_FD_STEP;
            assert_close(
                d_analytic,
                (d_lp - d_lm) / (2.0 * D_FD_STEP),
                "attention_grad_w_q",
            );

            let d_analytic_o = attn.tensor_w_o.a_grad[[i, j]];
            attn.tensor_w_o.a_value[[i, j]] += D_FD_STEP;
            let d_lp = weighted_sum(&attn.forward(&a_x, Some(&a_mask)).unwrap().0, &a_lw);
            attn.tensor_w_o.a_value[[i, j]] -= 2.0 * D_FD_STEP;
            let d_lm = weighted_sum(&attn.forward(&a_x, Some(&a_mask)).unwrap().0, &a_lw);
            attn.tensor_w_o.a_value[[i, j]] += D_FD_STEP;
            assert_close(
                d_analytic_o,
                (d_lp - d_lm) / (2.0 * D_FD_STEP),
                "attention_grad_w_o",
            );
        }
    }

    #[test]
    fn attention_causal_weights_are_zero_above_diagonal() {
        let mut rng = StdRng::seed_from_u64(45);
        let i_len = 5;
        let a_x = math::random_matrix(i_len, 8, 1.0, &mut rng).unwrap();
        let a_mask = causal_mask(i_len);

        let attn = MultiHeadSelfAttention::new("test", 8, 4, &mut rng).unwrap();
        let (_, ctx) = attn.forward(&a_x, Some(&a_mask)).unwrap();

        for a_w in ctx.head_weights() {
            for i in 0..i_len {
                for j in (i + 1)..i_len {
                    assert_eq!(a_w[[i, j]], 0.0);
                }
                let d_sum: f64 = a_w.row(i).iter().sum();
                assert!((d_sum - 1.0).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn attention_rejects_indivisible_heads() {
        let mut rng = StdRng::seed_from_u64(46);
        let r = MultiHeadSelfAttention::new("test", 10, 3, &mut rng);
        assert!(r.is_err());
        assert!(r
            .unwrap_err()
            .starts_with("attention_d_model_not_divisible_by_num_heads"));
    }

    #[test]
    fn embeddings_scatter_accumulates_repeated_tokens() {
        let mut rng = StdRng::seed_from_u64(47);
        let mut emb =
            Embeddings::new(5, 4, 8, PositionalEncoding::Sinusoidal, &mut rng).unwrap();

        let v_tokens = vec![1usize, 1, 2];
        let (_, ctx) = emb.forward(&v_tokens).unwrap();

        let a_grads = Array2::ones((3, 4));
        emb.backward(ctx, &a_grads).unwrap();

        let a_g = &emb.tensor_token.a_grad;
        for j in 0..4 {
            assert_eq!(a_g[[1, j]], 2.0);
            assert_eq!(a_g[[2, j]], 1.0);
            assert_eq!(a_g[[0, j]], 0.0);
        }
    }

    #[test]
    fn sinusoidal_table_uses_per_feature_frequency() {
        let i_d = 6;
        let a_table = Embeddings::sinusoidal_table(4, i_d);

        for i_pos in 0..4 {
            for j in 0..i_d {
                let d_freq =
                    (i_pos as f64) / 10000f64.powf((j as f64) / (i_d as f64));
                let d_expected = if j % 2 == 0 { d_freq.sin() } else { d_freq.cos() };
                assert!((a_table[[i_pos, j]] - d_expected).abs() < 1e-15);
            }
        }

        // Position 0: sin features are 0, cos features are 1.
        for j in 0..i_d {
            let d_expected = if j % 2 == 0 { 0.0 } else { 1.0 };
            assert_eq!(a_table[[0, j]], d_expected);
        }
    }

    #[test]
    fn embeddings_learned_positions_accumulate() {
        let mut rng = StdRng::seed_from_u64(48);
        let mut emb = Embeddings::new(5, 4, 8, PositionalEncoding::Learned, &mut rng).unwrap();
        assert_eq!(emb.parameters().len(), 2);

        let v_tokens = vec![0usize, 3];
        let (_, ctx) = emb.forward(&v_tokens).unwrap();
        emb.backward(ctx, &Array2::ones((2, 4))).unwrap();

        let a_pg = &emb.opt_tensor_pos.as_ref().unwrap().a_grad;
        for j in 0..4 {
            assert_eq!(a_pg[[0, j]], 1.0);
            assert_eq!(a_pg[[1, j]], 1.0);
            assert_eq!(a_pg[[2, j]], 0.0);
        }
    }

    #[test]
    fn embeddings_reject_out_of_range_token() {
        let mut rng = StdRng::seed_from_u64(49);
        let emb = Embeddings::new(5, 4, 8, PositionalEncoding::Sinusoidal, &mut rng).unwrap();
        let r = emb.forward(&[0, 5]);
        assert!(r.is_err());
        assert!(r.unwrap_err().starts_with("token_id_out_of_range"));
    }

    #[test]
    fn block_gradient_check_through_residuals() {
        let mut rng = StdRng::seed_from_u64(50);
        let i_len = 3;
        let a_x = math::random_matrix(i_len, 4, 1.0, &mut rng).unwrap();
        let a_lw = math::random_matrix(i_len, 4, 1.0, &mut rng).unwrap();
        let a_mask = causal_mask(i_len);

        let mut block = TransformerBlock::new("block_0", 4, 2, 8, &mut rng).unwrap();

        let (_, ctx) = block.forward(&a_x, &a_mask).unwrap();
        let a_grad_x = block.backward(ctx, &a_lw).unwrap();

        for &(i, j) in [(0usize, 0usize), (1, 2), (2, 3)].iter() {
            let mut a_plus = a_x.clone();
            a_plus[[i, j]] += D_FD_STEP;
            let mut a_minus = a_x.clone();
            a_minus[[i, j]] -= D_FD_STEP;

            let d_lp = weighted_sum(&block.forward(&a_plus, &a_mask).unwrap().0, &a_lw);
            let d_lm = weighted_sum(&block.forward(&a_minus, &a_mask).unwrap().0, &a_lw);
            assert_close(
                a_grad_x[[i, j]],
                (d_lp - d_lm) / (2.0 * D_FD_STEP),
                "block_grad_input",
            );
        }
    }

    #[test]
    fn block_parameter_names_are_unique() {
        let mut rng = StdRng::seed_from_u64(51);
        let block = TransformerBlock::new("block_0", 4, 2, 8, &mut rng).unwrap();

        let v_names: Vec<&str> = block.parameters().iter().map(|p| p.s_name.as_str()).collect();
        let mut v_sorted = v_names.clone();
        v_sorted.sort();
        v_sorted.dedup();

        assert_eq!(v_names.len(), 12);
        assert_eq!(v_sorted.len(), v_names.len());
    }
}
