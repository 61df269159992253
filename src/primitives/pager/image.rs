//! Versioned binary image of a spilled column page.
//!
//! Layout (big-endian): a fixed 40-byte header followed by the page's columns
//! in column-major order, each element stored as its raw `f64` bit pattern so
//! NaN payloads and signed zeros survive the round trip.

use std::ops::Range;

use bytes::{Buf, BufMut, BytesMut};

use crate::types::{ColumnId, MatrixError, PageId, Result};

/// Magic bytes opening every page image.
pub const IMAGE_MAGIC: [u8; 4] = *b"SPMC";
/// Current image format version.
pub const IMAGE_FORMAT_VERSION: u16 = 1;
/// Length of the fixed image header.
pub const IMAGE_HDR_LEN: usize = 40;
const ELEM_WIDTH: u16 = std::mem::size_of::<f64>() as u16;

const HDR_MAGIC: Range<usize> = 0..4;
const HDR_VERSION: Range<usize> = 4..6;
const HDR_ELEM_WIDTH: Range<usize> = 6..8;
const HDR_PAGE_ID: Range<usize> = 8..16;
const HDR_COL_FROM: Range<usize> = 16..24;
const HDR_ROWS: Range<usize> = 24..28;
const HDR_COLS: Range<usize> = 28..32;
const HDR_CRC32: Range<usize> = 32..36;
const HDR_RESERVED: Range<usize> = 36..40;

/// Decoded image header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageHeader {
    /// Page the image belongs to.
    pub page_id: PageId,
    /// First column stored in the image.
    pub col_from: ColumnId,
    /// Elements per column.
    pub rows: u32,
    /// Number of columns.
    pub cols: u32,
    /// Payload checksum.
    pub crc32: u32,
}

/// Incrementally builds a page image column by column.
pub struct ImageWriter {
    page_id: PageId,
    col_from: ColumnId,
    rows: usize,
    cols: usize,
    pushed: usize,
    payload: BytesMut,
}

impl ImageWriter {
    /// Starts an image for `cols` columns of `rows` elements each.
    pub fn new(page_id: PageId, col_from: ColumnId, rows: usize, cols: usize) -> Result<Self> {
        if u32::try_from(rows).is_err() || u32::try_from(cols).is_err() {
            return Err(MatrixError::InvalidArgument(format!(
                "page shape {rows}x{cols} exceeds image limits"
            )));
        }
        Ok(Self {
            page_id,
            col_from,
            rows,
            cols,
            pushed: 0,
            payload: BytesMut::with_capacity(rows * cols * ELEM_WIDTH as usize),
        })
    }

    /// Appends the next column.
    pub fn push_column(&mut self, column: &[f64]) -> Result<()> {
        if self.pushed == self.cols {
            return Err(MatrixError::InvalidArgument(
                "page image already holds every column".into(),
            ));
        }
        if column.len() != self.rows {
            return Err(MatrixError::InvalidArgument(format!(
                "column has {} rows, page expects {}",
                column.len(),
                self.rows
            )));
        }
        for value in column {
            self.payload.put_u64(value.to_bits());
        }
        self.pushed += 1;
        Ok(())
    }

    /// Seals the image, prepending the header.
    pub fn finish(self) -> Result<Vec<u8>> {
        if self.pushed != self.cols {
            return Err(MatrixError::InvalidArgument(format!(
                "page image has {} of {} columns",
                self.pushed, self.cols
            )));
        }
        let crc = image_crc32(self.page_id, &self.payload);
        let mut out = BytesMut::with_capacity(IMAGE_HDR_LEN + self.payload.len());
        out.put_slice(&IMAGE_MAGIC);
        out.put_u16(IMAGE_FORMAT_VERSION);
        out.put_u16(ELEM_WIDTH);
        out.put_u64(self.page_id.0);
        out.put_u64(self.col_from.0 as u64);
        out.put_u32(self.rows as u32);
        out.put_u32(self.cols as u32);
        out.put_u32(crc);
        out.put_u32(0);
        debug_assert_eq!(out.len(), IMAGE_HDR_LEN);
        out.put_slice(&self.payload);
        Ok(out.to_vec())
    }
}

/// CRC32 of the payload, seeded with the page id so an image stored under
/// another page's key fails verification.
fn image_crc32(page_id: PageId, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page_id.0.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

fn be_u16(buf: &[u8], range: Range<usize>) -> u16 {
    u16::from_be_bytes(buf[range].try_into().unwrap_or([0; 2]))
}

fn be_u32(buf: &[u8], range: Range<usize>) -> u32 {
    u32::from_be_bytes(buf[range].try_into().unwrap_or([0; 4]))
}

fn be_u64(buf: &[u8], range: Range<usize>) -> u64 {
    u64::from_be_bytes(buf[range].try_into().unwrap_or([0; 8]))
}

/// Parses and validates only the header of an image.
pub fn decode_header(buf: &[u8]) -> Result<ImageHeader> {
    if buf.len() < IMAGE_HDR_LEN {
        return Err(MatrixError::Corruption("page image truncated"));
    }
    if buf[HDR_MAGIC] != IMAGE_MAGIC {
        return Err(MatrixError::Corruption("page image magic mismatch"));
    }
    if be_u16(buf, HDR_VERSION) != IMAGE_FORMAT_VERSION {
        return Err(MatrixError::Corruption("unsupported page image version"));
    }
    if be_u16(buf, HDR_ELEM_WIDTH) != ELEM_WIDTH {
        return Err(MatrixError::Corruption("unsupported element width"));
    }
    if be_u32(buf, HDR_RESERVED) != 0 {
        return Err(MatrixError::Corruption("reserved header bytes set"));
    }
    let col_from = usize::try_from(be_u64(buf, HDR_COL_FROM))
        .map_err(|_| MatrixError::Corruption("column offset overflow"))?;
    Ok(ImageHeader {
        page_id: PageId(be_u64(buf, HDR_PAGE_ID)),
        col_from: ColumnId(col_from),
        rows: be_u32(buf, HDR_ROWS),
        cols: be_u32(buf, HDR_COLS),
        crc32: be_u32(buf, HDR_CRC32),
    })
}

/// Decodes a full image, verifying length and checksum.
pub fn decode_image(buf: &[u8]) -> Result<(ImageHeader, Vec<Box<[f64]>>)> {
    let header = decode_header(buf)?;
    let rows = header.rows as usize;
    let cols = header.cols as usize;
    let expected = rows
        .checked_mul(cols)
        .and_then(|n| n.checked_mul(ELEM_WIDTH as usize))
        .ok_or(MatrixError::Corruption("page image shape overflow"))?;
    let mut payload = &buf[IMAGE_HDR_LEN..];
    if payload.len() != expected {
        return Err(MatrixError::Corruption("page image length mismatch"));
    }
    if image_crc32(header.page_id, payload) != header.crc32 {
        return Err(MatrixError::Corruption("page image crc mismatch"));
    }
    let mut columns = Vec::with_capacity(cols);
    for _ in 0..cols {
        let mut column = Vec::with_capacity(rows);
        for _ in 0..rows {
            column.push(f64::from_bits(payload.get_u64()));
        }
        columns.push(column.into_boxed_slice());
    }
    Ok((header, columns))
}
