use accelop_backend_cuda::CudaContext;

fn context_or_skip() -> Option<CudaContext> {
    if !CudaContext::is_available() {
        eprintln!("CUDA driver or cuTENSOR not available; skipping CUDA suite");
        return None;
    }
    match CudaContext::from_env() {
        Ok(ctx) => Some(ctx),
        Err(err) => {
            eprintln!("failed to create CUDA context ({err}); skipping CUDA suite");
            None
        }
    }
}

accelop_backend_tests::define_transpose_tests!(cuda_suite, context_or_skip);
