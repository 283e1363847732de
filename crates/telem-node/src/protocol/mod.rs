pub mod ubx;

/// Identifiers the transport layer uses to tag each produced message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    NavFix = 1,
    Baro = 2,
}

impl From<MessageType> for u32 {
    fn from(t: MessageType) -> u32 {
        t as u32
    }
}

/// Trait implemented by values the node hands to its outbound sender.
pub trait TelemMsg {
    const MSG_TYPE: MessageType;

    fn msg_type(&self) -> MessageType {
        Self::MSG_TYPE
    }

    /// Local sequence number, advanced each time the consumer prepares the next measure.
    fn sequence(&self) -> u32;
}
