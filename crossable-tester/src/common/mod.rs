pub mod scenario;
pub mod util;

pub use util::{format_cents, split_csv};
