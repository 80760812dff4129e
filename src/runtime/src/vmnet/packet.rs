//! Reusable packet slot arrays.

use super::status::VmnetReturn;

/// One packet slot: a fixed-capacity buffer, the used length and flags.
#[derive(Debug, Clone)]
struct Slot {
    data: Box<[u8]>,
    len: usize,
    flags: u32,
}

impl Slot {
    fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
            flags: 0,
        }
    }
}

/// Pre-allocated packet slots sized to an interface's max packet size.
///
/// Reused across read and write calls; no per-packet allocation happens
/// after construction.
#[derive(Debug, Clone)]
pub struct PacketBuffer {
    slots: Vec<Slot>,
    max_packet_size: usize,
}

impl PacketBuffer {
    pub fn new(slot_count: usize, max_packet_size: usize) -> Self {
        Self {
            slots: (0..slot_count).map(|_| Slot::new(max_packet_size)).collect(),
            max_packet_size,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Whether this buffer can be reused for the given geometry as is.
    pub fn fits(&self, slot_count: usize, max_packet_size: usize) -> bool {
        self.max_packet_size == max_packet_size && self.slots.len() >= slot_count
    }

    /// Reallocate when the geometry changed; stale slot sizes are never reused.
    pub fn reallocate(&mut self, slot_count: usize, max_packet_size: usize) {
        if !self.fits(slot_count, max_packet_size) {
            *self = Self::new(slot_count, max_packet_size);
        }
    }

    /// Payload of slot `index`; `None` past the last slot.
    pub fn packet(&self, index: usize) -> Option<&[u8]> {
        self.slots.get(index).map(|slot| &slot.data[..slot.len])
    }

    /// Full-capacity storage of slot `index` for filling in place; follow up with [`set_len`](Self::set_len).
    pub fn slot_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        self.slots.get_mut(index).map(|slot| &mut slot.data[..])
    }

    pub fn set_len(&mut self, index: usize, len: usize) -> Result<(), VmnetReturn> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(VmnetReturn::TooManyPackets)?;
        if len > slot.data.len() {
            return Err(VmnetReturn::PacketTooBig);
        }
        slot.len = len;
        Ok(())
    }

    /// Copy `payload` into slot `index`.
    pub fn set_packet(&mut self, index: usize, payload: &[u8]) -> Result<(), VmnetReturn> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(VmnetReturn::TooManyPackets)?;
        if payload.len() > slot.data.len() {
            return Err(VmnetReturn::PacketTooBig);
        }
        slot.data[..payload.len()].copy_from_slice(payload);
        slot.len = payload.len();
        slot.flags = 0;
        Ok(())
    }

    pub fn flags(&self, index: usize) -> Option<u32> {
        self.slots.get(index).map(|slot| slot.flags)
    }

    pub fn set_flags(&mut self, index: usize, flags: u32) -> Result<(), VmnetReturn> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(VmnetReturn::TooManyPackets)?;
        slot.flags = flags;
        Ok(())
    }

    /// Clear lengths and flags of every slot.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.len = 0;
            slot.flags = 0;
        }
    }

    /// Payloads of the first `count` slots.
    pub fn packets(&self, count: usize) -> impl Iterator<Item = &[u8]> {
        self.slots
            .iter()
            .take(count)
            .map(|slot| &slot.data[..slot.len])
    }
}
