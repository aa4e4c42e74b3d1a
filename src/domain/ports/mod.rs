mod ephemeral_store;

pub use ephemeral_store::{EphemeralStore, StoreError, WindowOutcome};
