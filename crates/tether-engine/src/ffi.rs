//! C entry points for native call-ins
//!
//! An engine binding written in C or C++ calls these symbols. Every fatal
//! condition panics; with the `C-unwind` ABI the panic propagates through
//! the native frames instead of being undefined behavior.

use crate::dispatch;
use tether_sdk::{CallbackRef, ContextRef, RawHandle};

/// Invoke a host callback
///
/// `this_and_args` points at `argc + 1` handles: the receiver followed by
/// `argc` arguments. Returns the result handle, or 0 for no value.
///
/// # Safety
///
/// `this_and_args` must be valid for reads of `argc + 1` handles for the
/// duration of the call.
#[no_mangle]
pub unsafe extern "C-unwind" fn tether_function_callback(
    ctx_ref: u32,
    cb_ref: u32,
    this_and_args: *const u64,
    argc: usize,
) -> u64 {
    if this_and_args.is_null() {
        crate::error::fatal("function call-in with a null argument array");
    }
    let Some(len) = argc.checked_add(1) else {
        crate::error::fatal("function call-in argument count overflows");
    };
    // SAFETY: RawHandle is a transparent u64 and the caller guarantees the
    // array holds argc + 1 readable elements
    let handles = unsafe { std::slice::from_raw_parts(this_and_args.cast::<RawHandle>(), len) };

    dispatch::function_callback(
        ContextRef::from_u32(ctx_ref),
        CallbackRef::from_u32(cb_ref),
        handles,
    )
    .map_or(0, RawHandle::as_raw)
}

/// Resolve a context reference to its native context pointer
///
/// Unknown references are fatal.
#[no_mangle]
pub extern "C-unwind" fn tether_context_ptr(ctx_ref: u32) -> u64 {
    dispatch::resolve_context(ContextRef::from_u32(ctx_ref))
        .native_ptr()
        .as_raw()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "null argument array")]
    fn test_null_array_is_fatal() {
        unsafe {
            tether_function_callback(1, 1, std::ptr::null(), 0);
        }
    }

    #[test]
    #[should_panic(expected = "argument count overflows")]
    fn test_argc_overflow_is_fatal() {
        let receiver = 0u64;
        unsafe {
            tether_function_callback(1, 1, &receiver, usize::MAX);
        }
    }

    #[test]
    #[should_panic(expected = "Unknown context reference")]
    fn test_unknown_context_ptr_is_fatal() {
        tether_context_ptr(u32::MAX);
    }
}
