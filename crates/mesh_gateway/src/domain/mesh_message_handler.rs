use common::domain::MeshMessage;

/// Consumer of decoded bus messages, invoked in arrival order
///
/// Implementations must not block: the subscriber calls this inline from
/// its event loop.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait MeshMessageHandler: Send + Sync {
    fn handle_message(&self, message: MeshMessage);
}
