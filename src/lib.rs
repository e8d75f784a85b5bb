pub mod channel;
pub mod cleanup;
pub mod device;
pub mod driver;
pub mod export;
pub mod fast_forward;
pub mod inspect;
pub mod iterator;
pub mod midi;
pub mod pcm;
pub mod resource;
pub mod sci0;
pub mod sci1;
pub mod tee;

pub use driver::*;
pub use iterator::{
    BoxedIterator, Delivery, IteratorSlot, Message, MessageBody, ReaderMask, SharedIterator,
    SongIterator, SongIteratorId, Step,
};

fn convert_error<I: std::ops::Deref<Target = [u8]>>(
    input: I,
    e: nom::Err<nom::error::VerboseError<I>>,
) -> String {
    use std::fmt::Write;

    let e = match e {
        nom::Err::Incomplete(nom::Needed::Unknown) => return "Incomplete".into(),
        nom::Err::Incomplete(nom::Needed::Size(n)) => return format!("Need {n} more bytes"),
        nom::Err::Error(e) | nom::Err::Failure(e) => e,
    };
    let mut result = String::new();
    for (i, (substring, kind)) in e.errors.iter().enumerate() {
        let offset = nom::Offset::offset(&*input, substring);

        let _ = if i == 0 {
            write!(&mut result, "Parse error at position 0x{offset:x}")
        } else {
            write!(&mut result, ", 0x{offset:x}")
        };

        let _ = match kind {
            nom::error::VerboseErrorKind::Char(c) => write!(&mut result, " (expected '{c}')"),
            nom::error::VerboseErrorKind::Context(context) => write!(&mut result, " in {context}"),
            nom::error::VerboseErrorKind::Nom(err) => write!(&mut result, " ({err:?})"),
        };
    }
    result
}

#[inline]
fn invalid_data(args: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, args.to_string())
}

#[inline]
fn is_log_level(lvl: log::LevelFilter) -> bool {
    lvl <= log::STATIC_MAX_LEVEL && lvl <= log::max_level()
}
