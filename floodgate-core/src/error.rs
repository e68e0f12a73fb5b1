/// A type alias for `anyhow::Error`.
///
/// Driver and worker internals that have no dedicated error enum report
/// failures through this type; typed errors live next to the module that
/// produces them.
pub type AnyError = anyhow::Error;

/// A `Result` whose error defaults to [`AnyError`].
pub type AnyResult<T, E = AnyError> = std::result::Result<T, E>;

#[macro_export]
macro_rules! bail_into {
    ($msg:literal $(,)?) => {
        return Err(::anyhow::anyhow!($msg).into())
    };
    ($err:expr $(,)?) => {
        return Err(::anyhow::anyhow!($err).into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err(::anyhow::anyhow!($fmt, $($arg)*).into())
    };
}
