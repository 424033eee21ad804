//! Card-directed event encoding.
//!
//! Channels report state changes and buffered inbound data to the card
//! through event downloads. The encoding is a fixed additional-info byte
//! layout: a channel-status TLV (tag 0xb8) and, for data-available events, a
//! channel-data-length TLV (tag 0xb7).

const CHANNEL_STATUS_TAG: u8 = 0xb8;
const DATA_LENGTH_TAG: u8 = 0xb7;

/// Asynchronous event emitted toward the card session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The link state of a channel changed outside of a command exchange.
    StatusChanged {
        /// Channel status word at the time of the change.
        status: u16,
    },
    /// Inbound bytes are buffered and ready for RECEIVE_DATA.
    DataAvailable {
        /// Channel status word.
        status: u16,
        /// Buffered byte count, clipped to one byte.
        available: u8,
    },
}

impl ChannelEvent {
    /// Event code for the event download envelope, per TS 102 223 §8.25.
    pub fn code(&self) -> u8 {
        match self {
            Self::DataAvailable { .. } => 0x09,
            Self::StatusChanged { .. } => 0x0a,
        }
    }

    /// Fixed-layout additional-info bytes for the event download.
    pub fn additional_info(&self) -> Vec<u8> {
        match *self {
            Self::StatusChanged { status } => {
                vec![
                    CHANNEL_STATUS_TAG,
                    0x02,
                    (status >> 8) as u8,
                    (status & 0xff) as u8,
                ]
            }
            Self::DataAvailable { status, available } => {
                vec![
                    CHANNEL_STATUS_TAG,
                    0x02,
                    (status >> 8) as u8,
                    (status & 0xff) as u8,
                    DATA_LENGTH_TAG,
                    0x01,
                    available,
                ]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_changed_layout() {
        let event = ChannelEvent::StatusChanged { status: 0x4003 };
        assert_eq!(event.code(), 0x0a);
        assert_eq!(event.additional_info(), vec![0xb8, 0x02, 0x40, 0x03]);
    }

    #[test]
    fn data_available_layout() {
        let event = ChannelEvent::DataAvailable {
            status: 0x8001,
            available: 0xff,
        };
        assert_eq!(event.code(), 0x09);
        assert_eq!(
            event.additional_info(),
            vec![0xb8, 0x02, 0x80, 0x01, 0xb7, 0x01, 0xff]
        );
    }
}
