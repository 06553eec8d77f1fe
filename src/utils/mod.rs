//! Various utilities functions and types

mod sealed_file;

pub(crate) use self::sealed_file::SealedFile;

/// This resource is not managed by this crate
#[derive(Debug)]
pub struct UnmanagedResource;

impl std::fmt::Display for UnmanagedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("This resource is not managed by wl-dmabuf.")
    }
}

impl std::error::Error for UnmanagedResource {}

/// Route log output of the tests through the test harness, filtered by `RUST_LOG`
#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
