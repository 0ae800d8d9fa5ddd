mod requests;
mod store;

pub use requests::*;
pub use store::KvStore;
