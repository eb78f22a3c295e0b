use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;

/// Inputs shorter than this run on the calling thread.
const PAR_THRESHOLD: usize = 1 << 14;

/// Element-wise `dst += src`.
///
/// This is the "reduce" half of every ring collective: each hop adds the
/// segment received from the left neighbour into the local buffer.
pub fn cpu_add_assign<T>(dst: &mut [T], src: &[T]) -> Result<()>
where
    T: KernelElem,
{
    if dst.len() != src.len() {
        return Err(KernelError::LengthMismatch {
            expected: dst.len(),
            got: src.len(),
        });
    }

    if dst.len() < PAR_THRESHOLD {
        for (d, &s) in dst.iter_mut().zip(src) {
            *d += s;
        }
    } else {
        dst.par_iter_mut()
            .zip(src.par_iter())
            .for_each(|(d, &s)| *d += s);
    }
    Ok(())
}

/// Divides every element by `divisor` in place.
///
/// Used for data-parallel averaging, where `divisor` is the group size.
pub fn cpu_div_scalar<T>(data: &mut [T], divisor: usize) -> Result<()>
where
    T: KernelElem,
{
    if divisor == 0 {
        return Err(KernelError::InvalidDivisor);
    }
    if divisor == 1 {
        return Ok(());
    }
    let d = T::from_usize(divisor).ok_or(KernelError::InvalidDivisor)?;

    if data.len() < PAR_THRESHOLD {
        for x in data.iter_mut() {
            *x /= d;
        }
    } else {
        data.par_iter_mut().for_each(|x| *x /= d);
    }
    Ok(())
}
