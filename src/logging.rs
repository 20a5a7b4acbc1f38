//! Installs the engine logger behind the [`log`] facade.
//!
//! Everything in this crate logs through [`log`] macros so embedders are
//! free to install their own sink instead. This module provides the
//! default: an [`env_logger`] backend configured from the environment.

use log::LevelFilter;

use crate::error::Error;

/// Installs the default logger.
///
/// Calling this twice (or after any other logger was installed) returns
/// [`Error::AlreadyExistsError`] and leaves the existing logger untouched.
pub fn install_logger() -> Result<(), Error> {
    let logger = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    ).build();

    let max_level = logger.filter();

    log::set_boxed_logger(Box::new(logger)).map_err(|_| Error::AlreadyExistsError)?;
    log::set_max_level(max_level);

    Ok(())
}

/// Installs the default logger with an explicit level, ignoring the
/// environment. Intended for tests and quick embedding.
pub fn install_logger_with_level(level: LevelFilter) -> Result<(), Error> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);

    log::set_boxed_logger(Box::new(builder.build())).map_err(|_| Error::AlreadyExistsError)?;
    log::set_max_level(level);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_fails() {
        // Which install wins depends on test ordering, only the error of
        // the second one is deterministic.
        let first = install_logger();
        let second = install_logger();

        assert!(first.is_ok() || first == Err(Error::AlreadyExistsError));
        assert_eq!(second, Err(Error::AlreadyExistsError));
    }
}
