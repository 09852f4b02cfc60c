//! Maps `sqlx::Error` onto the core [`JournalError`] taxonomy.
//!
//! `JournalError` lives in `journal-core`, which has no `sqlx`
//! dependency, so a blanket `From<sqlx::Error>` conversion there is not
//! possible without coupling the core crate to a concrete driver. This
//! extension trait keeps the conversion local to the driver crate
//! instead.

use journal_core::error::JournalError;

pub(crate) trait SqlxResultExt<T> {
    fn storage_err(self) -> Result<T, JournalError>;
}

impl<T> SqlxResultExt<T> for Result<T, sqlx::Error> {
    fn storage_err(self) -> Result<T, JournalError> {
        self.map_err(|e| JournalError::Storage(anyhow::Error::new(e)))
    }
}
