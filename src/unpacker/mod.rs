// SPDX-FileCopyrightText: The taxel authors
// SPDX-License-Identifier: MPL-2.0

//! Reassembly of full sensor frames from per-endpoint wire packets.
//!
//! The surface streams each half of the sensor over its own isochronous
//! endpoint. Both streams carry the same sequence numbers, so complete
//! frames are recovered by matching packet pairs. Transport loss shows up
//! either as zero-length packets or as gaps in the sequence numbers and is
//! resolved by discarding until both streams line up again. Reordering
//! across a stream does not happen on isochronous pipes.

use std::collections::VecDeque;

use strum::{EnumCount, EnumIter, FromRepr};

use crate::frame::{Grid, GridRecycler, GridSize, SequencedFrame};


/// Packed 12-bit payload bytes per packet.
pub const PAYLOAD_LEN: usize = 384;

/// Payload plus little-endian `u16` sequence number plus two padding bytes.
pub const PACKET_LEN: usize = PAYLOAD_LEN + 4;

/// Sensor columns carried by one endpoint.
pub const HALF_FRAME_COLUMNS: usize = 32;

/// Sensor rows carried by every packet.
pub const SENSOR_ROWS: usize = 8;

/// Full range of a packed taxel magnitude.
const TAXEL_SCALE: f32 = 4096.0;

/// Retained packets per endpoint.
///
/// Twice the usual number of outstanding transfers on the transport, so a
/// stalled sibling endpoint cannot starve the matcher.
const PACKET_RING_DEPTH: usize = 8;

/// Source endpoint of a wire packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, EnumIter, EnumCount)]
#[repr(u8)]
pub enum Endpoint {
    Left = 0,
    Right = 1,
}

impl Endpoint {
    #[must_use]
    pub const fn column_offset(self) -> usize {
        match self {
            Self::Left => 0,
            Self::Right => HALF_FRAME_COLUMNS,
        }
    }
}

/// Wraparound-aware sequence number ordering.
///
/// Returns `true` if `a` precedes `b`, assuming the distance between live
/// sequence numbers never exceeds half the `u16` range.
#[must_use]
pub fn seq_before(a: u16, b: u16) -> bool {
    (b.wrapping_sub(a) as i16) > 0
}

#[derive(Debug)]
struct PendingPacket {
    seq: u16,
    payload: [u8; PAYLOAD_LEN],
}

/// Per-endpoint transport and matching counters.
///
/// Purely diagnostic. None of these conditions is an error, the matcher
/// always resynchronizes on its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnpackerStats {
    pub frames_emitted: u64,
    pub packets_fed: [u64; Endpoint::COUNT],
    pub lost_packets: [u64; Endpoint::COUNT],
    pub malformed_packets: [u64; Endpoint::COUNT],
    pub discarded_packets: [u64; Endpoint::COUNT],
    pub ring_overflows: [u64; Endpoint::COUNT],
    pub stale_pairs: u64,
}

/// Matches packet pairs and unpacks them into sensor frames.
#[derive(Debug)]
pub struct Unpacker {
    guard_columns: usize,
    rings: [VecDeque<PendingPacket>; Endpoint::COUNT],
    unpacked: VecDeque<SequencedFrame>,
    recycler: GridRecycler,
    last_emitted_seq: Option<u16>,
    stats: UnpackerStats,
}

impl Unpacker {
    /// Create an unpacker for the given sensor geometry.
    ///
    /// The wire format fixes the frame layout, so `size` must match two
    /// half frames side by side. `guard_columns` outermost columns on each
    /// side are cleared in every emitted frame. They carry mechanical edge
    /// artifacts instead of pressure.
    #[must_use]
    pub fn new(size: GridSize, guard_columns: usize) -> Self {
        debug_assert_eq!(size.width, 2 * HALF_FRAME_COLUMNS);
        debug_assert_eq!(size.height, SENSOR_ROWS);
        debug_assert!(guard_columns * 2 < size.width);
        Self {
            guard_columns,
            rings: [VecDeque::new(), VecDeque::new()],
            unpacked: VecDeque::new(),
            recycler: GridRecycler::new(size),
            last_emitted_seq: None,
            stats: UnpackerStats::default(),
        }
    }

    /// Feed an ordered batch of raw packets received on one endpoint.
    ///
    /// Zero-length packets mark transfers lost by the transport. All
    /// retained bytes are copied, the slices are not borrowed beyond this
    /// call. Completed frames become available via [`Unpacker::poll_frame`].
    pub fn feed<'a>(&mut self, endpoint: Endpoint, packets: impl IntoIterator<Item = &'a [u8]>) {
        let ring_index = endpoint as usize;
        for bytes in packets {
            self.stats.packets_fed[ring_index] += 1;
            if bytes.is_empty() {
                // Lost transfer, the sibling endpoint resolves the gap.
                self.stats.lost_packets[ring_index] += 1;
                log::trace!("Lost packet on {endpoint:?}");
                continue;
            }
            if bytes.len() != PACKET_LEN {
                self.stats.malformed_packets[ring_index] += 1;
                log::warn!(
                    "Ignoring malformed packet on {endpoint:?}: {len} bytes",
                    len = bytes.len()
                );
                continue;
            }
            let seq = u16::from_le_bytes([bytes[PAYLOAD_LEN], bytes[PAYLOAD_LEN + 1]]);
            let ring = &mut self.rings[ring_index];
            if ring.len() >= PACKET_RING_DEPTH {
                self.stats.ring_overflows[ring_index] += 1;
                log::warn!("Packet ring overflow on {endpoint:?}, dropping oldest");
                ring.pop_front();
            }
            let mut payload = [0u8; PAYLOAD_LEN];
            payload.copy_from_slice(&bytes[..PAYLOAD_LEN]);
            ring.push_back(PendingPacket { seq, payload });
        }
        self.match_pairs();
    }

    /// Next completed frame, in strictly increasing sequence order.
    pub fn poll_frame(&mut self) -> Option<SequencedFrame> {
        self.unpacked.pop_front()
    }

    /// Return a frame grid for reuse by subsequent frames.
    pub fn recycle_frame(&mut self, grid: Grid) {
        self.recycler.recycle(grid);
    }

    #[must_use]
    pub const fn stats(&self) -> UnpackerStats {
        self.stats
    }

    /// Drop all retained packets and pending frames.
    ///
    /// Counters are kept. Use after a transport restart, when sequence
    /// numbers start over.
    pub fn reset(&mut self) {
        for ring in &mut self.rings {
            ring.clear();
        }
        while let Some(frame) = self.unpacked.pop_front() {
            self.recycler.recycle(frame.grid);
        }
        self.last_emitted_seq = None;
    }

    fn match_pairs(&mut self) {
        loop {
            let Some(left_seq) = self.rings[0].front().map(|packet| packet.seq) else {
                break;
            };
            let Some(right_seq) = self.rings[1].front().map(|packet| packet.seq) else {
                break;
            };
            if left_seq == right_seq {
                let left = self.rings[0].pop_front();
                let right = self.rings[1].pop_front();
                let (Some(left), Some(right)) = (left, right) else {
                    break;
                };
                self.emit_pair(&left, &right);
            } else if seq_before(left_seq, right_seq) {
                self.rings[0].pop_front();
                self.stats.discarded_packets[0] += 1;
                log::trace!("Discarding unmatched packet {left_seq} on {endpoint:?}", endpoint = Endpoint::Left);
            } else {
                self.rings[1].pop_front();
                self.stats.discarded_packets[1] += 1;
                log::trace!("Discarding unmatched packet {right_seq} on {endpoint:?}", endpoint = Endpoint::Right);
            }
        }
    }

    fn emit_pair(&mut self, left: &PendingPacket, right: &PendingPacket) {
        debug_assert_eq!(left.seq, right.seq);
        let seq = left.seq;
        if let Some(last) = self.last_emitted_seq {
            if !seq_before(last, seq) {
                // Duplicate or ancient pair, e.g. after a transport hiccup.
                self.stats.stale_pairs += 1;
                log::trace!("Dropping stale frame pair {seq} (last emitted {last})");
                return;
            }
        }
        let mut grid = self.recycler.fetch();
        unpack_half(&left.payload, Endpoint::Left.column_offset(), &mut grid);
        unpack_half(&right.payload, Endpoint::Right.column_offset(), &mut grid);
        clear_guard_columns(&mut grid, self.guard_columns);
        self.unpacked.push_back(SequencedFrame { seq, grid });
        self.last_emitted_seq = Some(seq);
        self.stats.frames_emitted += 1;
    }
}

/// Unpack one half frame of packed 12-bit magnitudes into `grid`.
///
/// Two consecutive values share three bytes: the low byte of the first
/// value, a nibble of each, the high byte of the second value.
fn unpack_half(payload: &[u8; PAYLOAD_LEN], column_offset: usize, grid: &mut Grid) {
    const BYTES_PER_ROW: usize = HALF_FRAME_COLUMNS * 3 / 2;
    for y in 0..SENSOR_ROWS {
        let row = &payload[y * BYTES_PER_ROW..(y + 1) * BYTES_PER_ROW];
        for (pair_index, triplet) in row.chunks_exact(3).enumerate() {
            let (b0, b1, b2) = (triplet[0], triplet[1], triplet[2]);
            let first = u16::from(b0) | (u16::from(b1 & 0x0f) << 8);
            let second = u16::from(b1 >> 4) | (u16::from(b2) << 4);
            let x = column_offset + pair_index * 2;
            grid.set(x, y, f32::from(first) / TAXEL_SCALE);
            grid.set(x + 1, y, f32::from(second) / TAXEL_SCALE);
        }
    }
}

fn clear_guard_columns(grid: &mut Grid, guard_columns: usize) {
    for column in 0..guard_columns {
        let mirrored = grid.width() - 1 - column;
        for y in 0..grid.height() {
            grid.set(column, y, 0.0);
            grid.set(mirrored, y, 0.0);
        }
    }
}
