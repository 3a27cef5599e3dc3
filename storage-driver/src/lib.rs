//! Driver interface for content-addressed blob storage backends.

mod driver;
mod error;

pub use driver::check_remote;
pub use driver::Driver;
pub use driver::Metadata;
pub use driver::Persisted;
pub use driver::Reader;
pub use error::StorageError;
pub use error::StorageErrorBuilder;
pub use error::StorageErrorKind;
