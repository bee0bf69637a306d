//! Helper macros for sandbox ops.

/// Get the sandbox context from OpState with immutable borrow.
///
/// # Example
/// ```ignore
/// fn my_op(state: &mut OpState) -> bool {
///     let ctx = sandbox_ctx!(state);
///     ctx.channel.stream_cancelled()
/// }
/// ```
#[macro_export]
macro_rules! sandbox_ctx {
    ($state:expr) => {
        $state.borrow::<$crate::extensions::ipc::SandboxContext>()
    };
}

/// Get the sandbox context from OpState with mutable borrow.
#[macro_export]
macro_rules! sandbox_ctx_mut {
    ($state:expr) => {
        $state.borrow_mut::<$crate::extensions::ipc::SandboxContext>()
    };
}

/// Clone a field out of the context held in a shared OpState, for async ops
/// that must not hold the borrow across an await.
///
/// # Example
/// ```ignore
/// let channel = sandbox_clone!(state, channel);
/// channel.await_response(&id).await
/// ```
#[macro_export]
macro_rules! sandbox_clone {
    ($state:expr, $field:ident) => {{
        let state_ref = $state.borrow();
        state_ref
            .borrow::<$crate::extensions::ipc::SandboxContext>()
            .$field
            .clone()
    }};
}
