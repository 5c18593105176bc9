use crate::error::{TuError, TuResult};
use bincode::de::read::SliceReader;
use bincode::de::{Decoder, DecoderImpl};
use bincode::enc::Encoder;
use bincode::error::{DecodeError, EncodeError};
use bincode::Encode;

/// Controllers that can snapshot their runtime state, for diagnostics dumps
/// and to put a controller back into a recorded state in tests.
pub trait Freezable {
    /// The default implementation is to encode nothing (stateless).
    fn freeze<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        Encode::encode(&(), encoder)
    }

    /// Restores what `freeze` wrote, on an instance built the normal way.
    #[allow(unused_variables)]
    fn thaw<D: Decoder>(&mut self, decoder: &mut D) -> Result<(), DecodeError> {
        Ok(())
    }
}

struct Frozen<'a, T>(&'a T);

impl<T: Freezable> Encode for Frozen<'_, T> {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        self.0.freeze(encoder)
    }
}

pub fn freeze_to_vec<T: Freezable>(task: &T) -> TuResult<Vec<u8>> {
    bincode::encode_to_vec(Frozen(task), bincode::config::standard())
        .map_err(|e| TuError::new_with_cause("Failed to freeze state", e))
}

pub fn thaw_from_slice<T: Freezable>(task: &mut T, bytes: &[u8]) -> TuResult<()> {
    let mut decoder = DecoderImpl::new(SliceReader::new(bytes), bincode::config::standard(), ());
    task.thaw(&mut decoder)
        .map_err(|e| TuError::new_with_cause("Failed to thaw state", e))
}
