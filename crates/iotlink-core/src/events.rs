use bytes::Bytes;

/// Connectivity, configuration and command notifications fanned out by the
/// connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IotEvent {
    /// Body of a message on the device config topic, verbatim.
    Config(Bytes),
    /// Body of a message on the device command topic or one of its subfolders.
    Command(Bytes),
    /// A connect attempt failed or the link dropped; a retry has been scheduled.
    Reconnecting,
}
