//! In-place kernel ops over one contiguous view.

use klib_core::{DeviceView, KlibError};

use super::expect_args;
use crate::launch::KernelArgs;
use crate::runtime::Runtime;
use crate::{KernelError, Result};

/// Build an op that launches `entry` from `image` with the view's data
/// address as its only parameter and one thread per element.
pub fn inplace_kernel(
    op: &str,
    image: &str,
    entry: &str,
) -> impl Fn(&Runtime, &[DeviceView]) -> Result<Option<DeviceView>> + Send + Sync + 'static {
    let (op, image, entry) = (op.to_string(), image.to_string(), entry.to_string());
    move |rt: &Runtime, args: &[DeviceView]| {
        expect_args(&op, args, 1)?;
        let view = &args[0];
        if !view.is_contiguous() {
            return Err(KernelError::BadArguments {
                op: op.clone(),
                msg: format!("view with strides {:?} is not contiguous", view.strides()),
            });
        }
        let n = view.shape().try_numel().ok_or(KlibError::LayoutOverflow)?;
        let kernel = rt.resolve(&image, &entry, view.device())?;
        let mut kargs = KernelArgs::new();
        kargs.push_ptr(view.data_ptr());
        // One pointer argument; the kernel touches at most `n` elements.
        unsafe { rt.launch_1d(&kernel, &mut kargs, n)? };
        Ok(None)
    }
}
