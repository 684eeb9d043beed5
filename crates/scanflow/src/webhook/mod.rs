mod intake;
mod signature;

pub use intake::{router, Notifiers, WebhookState};
pub use signature::verify_signature;
