
pub mod errors;
pub mod chains;
pub mod dictionary;
pub mod tables;
pub mod grammar;
pub mod queue;
pub mod materialize;
pub mod precompute;
pub mod recovery;
pub mod session;
pub mod passphrase;
