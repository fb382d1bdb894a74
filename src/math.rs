// math.rs
// Description: Dense matrix kernel: construction, checked matrix multiply, transpose,
//              elementwise add/subtract/scale, row-wise softmax with exponent clamping,
//              ReLU and its gradient, gradient sanitization and clipping, plus a
//              cooperative (resumable, cancellable) matrix multiply task.
// History:
// - 2026-03-02: Consolidate numeric kernel into math.rs with shape-checked operations.
// - 2026-03-05: Add MatMulTask as a poll-driven variant of matmul for host schedulers.
// Author: Marcus Schlieper

use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Uniform};

// Softmax exponent clamp. Keeps exp() finite for extreme logits.
pub const D_EXP_CLAMP: f64 = 700.0;

fn check_dims(i_rows: usize, i_cols: usize) -> Result<(), String> {
    if i_rows == 0 || i_cols == 0 {
        return Err(format!(
            "matrix_dims_must_be_positive: rows={} cols={}",
            i_rows, i_cols
        ));
    }
    Ok(())
}

pub fn zeros(i_rows: usize, i_cols: usize) -> Result<Array2<f64>, String> {
    check_dims(i_rows, i_cols)?;
    Ok(Array2::zeros((i_rows, i_cols)))
}

// Uniform initialization in [-d_scale, d_scale] from an explicit seeded RNG.
pub fn random_matrix(
    i_rows: usize,
    i_cols: usize,
    d_scale: f64,
    rng: &mut StdRng,
) -> Result<Array2<f64>, String> {
    check_dims(i_rows, i_cols)?;
    if !d_scale.is_finite() || d_scale <= 0.0 {
        return Err(format!("random_matrix_scale_invalid: scale={}", d_scale));
    }

    let dist = Uniform::new_inclusive(-d_scale, d_scale)
        .map_err(|_| format!("random_matrix_range_invalid: scale={}", d_scale))?;

    Ok(Array2::from_shape_fn((i_rows, i_cols), |_| dist.sample(rng)))
}

pub fn matmul(a_lhs: &Array2<f64>, a_rhs: &Array2<f64>) -> Result<Array2<f64>, String> {
    if a_lhs.ncols() != a_rhs.nrows() {
        return Err(format!(
            "matmul_shape_mismatch: lhs={}x{} rhs={}x{}",
            a_lhs.nrows(),
            a_lhs.ncols(),
            a_rhs.nrows(),
            a_rhs.ncols()
        ));
    }
    Ok(a_lhs.dot(a_rhs))
}

pub fn transpose(a_x: &Array2<f64>) -> Array2<f64> {
    a_x.t().to_owned()
}

pub fn add(a_lhs: &Array2<f64>, a_rhs: &Array2<f64>) -> Result<Array2<f64>, String> {
    if a_lhs.raw_dim() != a_rhs.raw_dim() {
        return Err(format!(
            "add_shape_mismatch: lhs={}x{} rhs={}x{}",
            a_lhs.nrows(),
            a_lhs.ncols(),
            a_rhs.nrows(),
            a_rhs.ncols()
        ));
    }
    Ok(a_lhs + a_rhs)
}

pub fn subtract(a_lhs: &Array2<f64>, a_rhs: &Array2<f64>) -> Result<Array2<f64>, String> {
    if a_lhs.raw_dim() != a_rhs.raw_dim() {
        return Err(format!(
            "subtract_shape_mismatch: lhs={}x{} rhs={}x{}",
            a_lhs.nrows(),
            a_lhs.ncols(),
            a_rhs.nrows(),
            a_rhs.ncols()
        ));
    }
    Ok(a_lhs - a_rhs)
}

pub fn scale_by(a_x: &Array2<f64>, d_factor: f64) -> Array2<f64> {
    a_x.mapv(|x| x * d_factor)
}

// Row-wise softmax.
// - Subtracts the row maximum before exponentiation.
// - Clamps exponents to [-D_EXP_CLAMP, D_EXP_CLAMP].
// - A degenerate row (zero or non-finite sum) becomes a uniform distribution.
pub fn softmax_rows(a_logits: &Array2<f64>) -> Array2<f64> {
    let mut a_result = a_logits.clone();

    for mut a_row in a_result.rows_mut() {
        let d_max = a_row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let v_exp: Vec<f64> = a_row
            .iter()
            .map(|&x| (x - d_max).clamp(-D_EXP_CLAMP, D_EXP_CLAMP).exp())
            .collect();
        let d_sum: f64 = v_exp.iter().sum();

        if !d_sum.is_finite() || d_sum <= 0.0 {
            let d_uniform = 1.0 / (a_row.len() as f64).max(1.0);
            for j in 0..a_row.len() {
                a_row[j] = d_uniform;
            }
            continue;
        }

        for (j, &d_e) in v_exp.iter().enumerate() {
            a_row[j] = d_e / d_sum;
        }
    }

    a_result
}

pub fn relu(a_x: &Array2<f64>) -> Array2<f64> {
    a_x.mapv(|x| x.max(0.0))
}

// Gradient passes only where the pre-activation was strictly positive.
pub fn relu_backward(a_pre: &Array2<f64>, a_grads: &Array2<f64>) -> Result<Array2<f64>, String> {
    if a_pre.raw_dim() != a_grads.raw_dim() {
        return Err(format!(
            "relu_backward_shape_mismatch: pre={}x{} grads={}x{}",
            a_pre.nrows(),
            a_pre.ncols(),
            a_grads.nrows(),
            a_grads.ncols()
        ));
    }

    let a_mask = a_pre.mapv(|x| if x > 0.0 { 1.0 } else { 0.0 });
    Ok(a_grads * &a_mask)
}

pub fn column_sums(a_x: &Array2<f64>) -> Array2<f64> {
    a_x.sum_axis(Axis(0)).insert_axis(Axis(0))
}

// Replace non-finite values with 0.0 to avoid propagating NaN/Inf through updates.
pub fn sanitize_inplace(a_grads: &mut Array2<f64>) {
    for d in a_grads.iter_mut() {
        if !d.is_finite() {
            *d = 0.0;
        }
    }
}

// Global norm clipping.
// - Computes the L2 norm over all elements and rescales if norm > d_max_norm.
// - Non-finite gradients are sanitized before norm computation.
pub fn clip_global_norm(a_grads: &mut Array2<f64>, d_max_norm: f64) {
    if d_max_norm <= 0.0 || !d_max_norm.is_finite() {
        return;
    }

    sanitize_inplace(a_grads);

    let mut d_norm_sq: f64 = 0.0;
    for &d in a_grads.iter() {
        d_norm_sq += d * d;
    }

    if !d_norm_sq.is_finite() {
        a_grads.fill(0.0);
        return;
    }

    let d_norm = d_norm_sq.sqrt();
    if d_norm > d_max_norm && d_norm > 0.0 {
        let d_factor = d_max_norm / d_norm;
        a_grads.mapv_inplace(|x| x * d_factor);
    }
}

// ----------------------------------------
// Cooperative matrix multiply
// ----------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Done,
    Cancelled,
}

// A resumable unit of work computing lhs * rhs one output row per poll.
// Produces the same result as matmul. Not used by the default
// forward/backward path; intended for hosts with a frame budget.
pub struct MatMulTask {
    a_lhs: Array2<f64>,
    a_rhs: Array2<f64>,
    a_out: Array2<f64>,
    i_next_row: usize,
    b_cancelled: bool,
}

impl MatMulTask {
    pub fn new(a_lhs: Array2<f64>, a_rhs: Array2<f64>) -> Result<Self, String> {
        if a_lhs.ncols() != a_rhs.nrows() {
            return Err(format!(
                "matmul_task_shape_mismatch: lhs={}x{} rhs={}x{}",
                a_lhs.nrows(),
                a_lhs.ncols(),
                a_rhs.nrows(),
                a_rhs.ncols()
            ));
        }

        let a_out = Array2::zeros((a_lhs.nrows(), a_rhs.ncols()));
        Ok(Self {
            a_lhs,
            a_rhs,
            a_out,
            i_next_row: 0,
            b_cancelled: false,
        })
    }

    pub fn state(&self) -> TaskState {
        if self.b_cancelled {
            return TaskState::Cancelled;
        }
        if self.i_next_row >= self.a_lhs.nrows() {
            return TaskState::Done;
        }
        TaskState::Pending
    }

    // Computes one output row, then yields back to the caller.
    pub fn poll(&mut self) -> TaskState {
        if self.b_cancelled || self.i_next_row >= self.a_lhs.nrows() {
            return self.state();
        }

        let i_row = self.i_next_row;
        let i_inner = self.a_lhs.ncols();
        let i_cols = self.a_rhs.ncols();

        for j in 0..i_cols {
            let mut d_sum: f64 = 0.0;
            for k in 0..i_inner {
                d_sum += self.a_lhs[[i_row, k]] * self.a_rhs[[k, j]];
            }
            self.a_out[[i_row, j]] = d_sum;
        }

        self.i_next_row += 1;
        self.state()
    }

    pub fn cancel(&mut self) {
        self.b_cancelled = true;
    }

    pub fn into_output(self) -> Result<Array2<f64>, String> {
        match self.state() {
            TaskState::Done => Ok(self.a_out),
            TaskState::Cancelled => Err("matmul_task_cancelled".to_string()),
            TaskState::Pending => Err(format!(
                "matmul_task_incomplete: next_row={} rows={}",
                self.i_next_row,
                self.a_lhs.nrows()
            )),
        }
    }

    pub fn run_to_completion(mut self) -> Result<Array2<f64>, String> {
        while self.poll() == TaskState::Pending {}
        self.into_output()
    }
}
