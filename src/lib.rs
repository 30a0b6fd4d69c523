pub mod coordination;
pub mod error;
pub mod migrate;
pub mod resolve;
pub mod source;
pub mod store;

pub mod util {
    pub mod env;
}

pub use error::MigrateError;
