mod invoke;

pub use invoke::{ScanOutcome, Scanner};
