pub mod recording;
pub mod transpose;

pub use recording::{ContextEvent, RecordingContext};

/// Instantiates the transpose conformance suite for one backend.
///
/// `$ctx_ctor` is called once per test and returns `Option<Context>`; `None`
/// skips the test (e.g. when no accelerator is present).
#[macro_export]
macro_rules! define_transpose_tests {
    ($module:ident, $ctx_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            #[allow(unused_imports)]
            use super::*;
            use $crate::transpose;

            macro_rules! suite_test {
                ($name:ident) => {
                    #[test]
                    fn $name() {
                        let Some(ctx) = ($ctx_ctor)() else {
                            eprintln!(
                                "skipping {}: execution context unavailable",
                                stringify!($name)
                            );
                            return;
                        };
                        transpose::$name(&ctx);
                    }
                };
            }

            suite_test!(default_permutation_reverses_axes);
            suite_test!(constant_permutation_skips_transfer);
            suite_test!(runtime_permutation_every_index_type);
            suite_test!(runtime_permutation_is_read_every_call);
            suite_test!(runtime_float_permutation_is_unsupported);
            suite_test!(runtime_permutation_is_validated);
            suite_test!(low_rank_tensors_copy_through);
            suite_test!(scalar_runtime_permutation_is_empty_transfer);
            suite_test!(random_shapes_match_reference);
            suite_test!(float_element_types_are_preserved);
        }
    };
}
