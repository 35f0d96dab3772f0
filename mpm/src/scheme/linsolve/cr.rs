use super::{Real, SolveResult, Status};

/// Implementation of the conjugate residual method.
///
/// The Conjugate Residual method solves the system `Ax = b` where `A` is Hermitian, and `b` is non-zero.
/// https://en.wikipedia.org/wiki/Conjugate_residual_method
#[allow(non_snake_case)]
pub struct ConjugateResidual<T: Real> {
    max_iter: u32,
    tol: f32,
    p: na::DVector<T>,
    Ar: na::DVector<T>,
    Ap: na::DVector<T>,
}

fn result(iterations: u32, r_norm_sq: f64, b_norm_sq: f64, status: Status) -> SolveResult {
    let residual = r_norm_sq.sqrt();
    SolveResult {
        iterations,
        residual,
        error: if b_norm_sq > 0.0 {
            residual / b_norm_sq.sqrt()
        } else {
            residual
        },
        status,
    }
}

impl<T> ConjugateResidual<T>
where
    T: Real,
{
    #[allow(non_snake_case)]
    pub fn new(size: usize, max_iter: u32, tol: f32) -> Self {
        // Allocate p, Ap and Ar.
        let p = na::DVector::zeros(size);
        let Ar = na::DVector::zeros(size);
        let Ap = Ar.clone();

        ConjugateResidual {
            max_iter: u32::MAX.min(max_iter),
            tol: f32::EPSILON.max(tol),
            p,
            Ar,
            Ap,
        }
    }

    /// Solves `Ax = b` where the product `Ax` is provided by the function `matvec`.
    ///
    /// `matvec` takes in the vector `x` and the output mutable slice. If `matvec` returns
    /// false, then the computation stops and the `SolveResult` will report an interrupted status.
    /// On return `b` holds the final residual.
    #[allow(non_snake_case)]
    pub fn solve<F>(&mut self, mut matvec: F, x: &mut [T], b: &mut [T]) -> SolveResult
    where
        F: FnMut(&[T], &mut [T]) -> bool,
    {
        let ConjugateResidual {
            max_iter,
            tol,
            ref mut p,
            ref mut Ar,
            ref mut Ap,
        } = *self;

        let tol = tol as f64;

        debug_assert_eq!(b.len(), x.len());
        debug_assert_eq!(p.len(), x.len());

        let mut x: na::DVectorViewMut<T> = x.into();
        let mut r: na::DVectorViewMut<T> = b.into();

        let to_f64 = |v: T| v.to_f64().unwrap_or(f64::NAN);

        let b_norm_sq = to_f64(r.norm_squared());

        // Compute p = A*x0
        if !matvec(x.as_slice(), p.as_mut_slice()) {
            // Residual is unknown at this point.
            return result(0, 0.0, b_norm_sq, Status::Interrupted);
        }

        // r0 = b - p
        r.axpy(-T::one(), p, T::one());

        let mut r_norm_sq = to_f64(r.norm_squared());

        // Return if the residual norm is already zero.
        if r_norm_sq <= f64::EPSILON * f64::EPSILON * b_norm_sq.max(1.0) {
            return result(0, r_norm_sq, b_norm_sq, Status::Success);
        }

        // p0 = r0
        p.as_mut_slice().copy_from_slice(r.as_slice());

        // Initialize Ap0 and Ar0
        if !matvec(r.as_slice(), Ar.as_mut_slice()) {
            return result(0, r_norm_sq, b_norm_sq, Status::Interrupted);
        }
        Ap.as_mut_slice().copy_from_slice(Ar.as_slice());

        let mut rAr = r.dot(Ar);

        let mut iterations = 0;
        loop {
            // α = rAr/ p'A'Ap
            let alpha = rAr / Ap.dot(Ap);
            if !to_f64(alpha).is_finite() {
                return result(iterations, r_norm_sq, b_norm_sq, Status::NanDetected);
            }

            // x = x + α * p
            x.axpy(alpha, p, T::one());

            // r = r - α * Ap
            r.axpy(-alpha, Ap, T::one());

            iterations += 1;

            // Stop if |r_new| / |r_init| < tol
            // or if the iterations reaches max_iter.
            r_norm_sq = to_f64(r.norm_squared());
            if r_norm_sq < tol * tol * b_norm_sq {
                return result(iterations, r_norm_sq, b_norm_sq, Status::Success);
            } else if iterations >= max_iter {
                return result(
                    iterations,
                    r_norm_sq,
                    b_norm_sq,
                    Status::MaximumIterationsExceeded,
                );
            }

            // Compute new Ar
            if !matvec(r.as_slice(), Ar.as_mut_slice()) {
                return result(iterations, r_norm_sq, b_norm_sq, Status::Interrupted);
            }

            let rAr_new = r.dot(Ar);
            let beta = rAr_new / rAr;
            rAr = rAr_new;

            // p = r + βp
            p.axpy(T::one(), &r, beta);

            // Ap = Ar + βAp
            Ap.axpy(T::one(), Ar, beta);
        }
    }
}
