/// The external rate-limited session a worker is bound to.
///
/// Owned exclusively by one worker's consumer loop; task bodies borrow it
/// through their context.
pub trait ExternalSession: Send + Sync + 'static {
    fn session_name(&self) -> &str;
}

/// Session type for processes that are not bound to an external account,
/// such as the scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSession;

impl ExternalSession for NoSession {
    fn session_name(&self) -> &str {
        "none"
    }
}
