use std::{borrow::Cow, io};

use crate::{Deserialize, Serialize};

type Header = u64;
const HEADER_SIZE: usize = size_of::<Header>();

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug, PartialEq)]
pub enum Payload<'a> {
    Single(&'a [f32]),
    Double(&'a [f64]),
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Hello { rank: usize, world_size: usize },
}

/// The application layer message exchanged between ranks.
#[derive(Debug, PartialEq)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    /// Sent by the coordinator to abort a reduction, carrying the cause.
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    /// A short name for the message kind, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(Command::Hello { .. }) => "control/hello",
            Msg::Data(Payload::Single(_)) => "data/f32",
            Msg::Data(Payload::Double(_)) => "data/f64",
            Msg::Err(_) => "err",
        }
    }

    fn buf_is_too_small<T>(size: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {HEADER_SIZE} bytes"),
        ))
    }

    fn invalid_kind<T>(kind: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid kind header {kind}"),
        ))
    }

    fn misaligned<T>(err: bytemuck::PodCastError) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received a misaligned numeric payload: {err:?}"),
        ))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        let tail = match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&(0 as Header).to_be_bytes());
                Some(e.as_bytes())
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&(1 as Header).to_be_bytes());
                serde_json::to_writer(buf, cmd)?;
                None
            }
            Msg::Data(Payload::Single(nums)) => {
                buf.extend_from_slice(&(2 as Header).to_be_bytes());
                Some(bytemuck::cast_slice(nums))
            }
            Msg::Data(Payload::Double(nums)) => {
                buf.extend_from_slice(&(3 as Header).to_be_bytes());
                Some(bytemuck::cast_slice(nums))
            }
        };

        Ok(tail)
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a mut [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len());
        }

        let (kind_buf, rest) = buf.split_at(HEADER_SIZE);
        let mut raw = [0; HEADER_SIZE];
        raw.copy_from_slice(kind_buf);

        match Header::from_be_bytes(raw) {
            0 => {
                let string = std::str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            1 => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            2 => match bytemuck::try_cast_slice(rest) {
                Ok(nums) => Ok(Self::Data(Payload::Single(nums))),
                Err(e) => Self::misaligned(e),
            },
            3 => match bytemuck::try_cast_slice(rest) {
                Ok(nums) => Ok(Self::Data(Payload::Double(nums))),
                Err(e) => Self::misaligned(e),
            },
            kind => Self::invalid_kind(kind),
        }
    }
}
