//! On-disk and in-memory record framing.
//!
//! Every record is framed as `[len: u32 little-endian][payload][zero pad]`,
//! padded to a 4-byte boundary. The framing is identical in page memory and
//! on the device; a record's device offset equals its logical address.
//!
//! A zero length prefix never belongs to a record (empty entries are
//! rejected); pages are zero-initialized, so a zero length marks the padded
//! tail of a page during scans.

use crate::utility::pad_alignment;

/// Size of the length prefix preceding each payload
pub const HEADER_SIZE: usize = 4;

/// Records are padded to this alignment
pub const RECORD_ALIGNMENT: usize = 4;

/// Total allocated size of an entry with the given payload length
#[inline]
pub const fn entry_size(payload_len: usize) -> usize {
    HEADER_SIZE + pad_alignment(payload_len, RECORD_ALIGNMENT)
}

/// Total allocated size of a batch of payloads, or `None` on overflow
pub fn batch_size<T: AsRef<[u8]>>(entries: &[T]) -> Option<u64> {
    let mut total = 0u64;
    for entry in entries {
        total = total.checked_add(entry_size(entry.as_ref().len()) as u64)?;
    }
    Some(total)
}

/// Write a record frame at `dst`.
///
/// # Safety
///
/// `dst` must be valid for writes of `entry_size(payload.len())` bytes and
/// the padding bytes must already be zero (freshly opened pages are).
#[inline]
pub unsafe fn write_frame(dst: *mut u8, payload: &[u8]) {
    let len = (payload.len() as u32).to_le_bytes();
    std::ptr::copy_nonoverlapping(len.as_ptr(), dst, HEADER_SIZE);
    std::ptr::copy_nonoverlapping(payload.as_ptr(), dst.add(HEADER_SIZE), payload.len());
}

/// Decode the length prefix at the start of `buf`, if present
#[inline]
pub fn read_length(buf: &[u8]) -> Option<u32> {
    if buf.len() < HEADER_SIZE {
        return None;
    }
    Some(u32::from_le_bytes(buf[..HEADER_SIZE].try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_size() {
        assert_eq!(entry_size(1), 8);
        assert_eq!(entry_size(3), 8);
        assert_eq!(entry_size(4), 8);
        assert_eq!(entry_size(5), 12);
        assert_eq!(entry_size(8), 12);
    }

    #[test]
    fn test_batch_size() {
        let batch: [&[u8]; 3] = [&[0xAA], &[0xBB, 0xBB], &[0xCC, 0xCC, 0xCC, 0xCC]];
        assert_eq!(batch_size(&batch), Some(24));
    }

    #[test]
    fn test_frame_roundtrip() {
        let payload = b"hello";
        let mut buf = vec![0u8; entry_size(payload.len())];
        unsafe { write_frame(buf.as_mut_ptr(), payload) };

        assert_eq!(read_length(&buf), Some(5));
        assert_eq!(&buf[HEADER_SIZE..HEADER_SIZE + 5], payload);
        // Padding stays zero.
        assert!(buf[HEADER_SIZE + 5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_length_short_buffer() {
        assert_eq!(read_length(&[1, 2, 3]), None);
    }
}
