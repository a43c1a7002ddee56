use accelop_backend_host::HostContext;

accelop_backend_tests::define_transpose_tests!(host_suite, || Some(HostContext::new()));
