//! Decompression of section payloads
//!
//! EFI 1.1 and Tiano compression share a container format: a 32-bit
//! compressed size followed by a 32-bit decompressed size, then the bit stream.
//! The two differ only in a few Huffman table parameters, so a stream can
//! successfully decode as both; callers decide by looking at the output.
//!
//! LZMA streams are in the `.lzma` "alone" format with a 13-byte header.
//! The F86 variant additionally runs the x86 branch-call-jump (BCJ) decoder
//! from the LZMA SDK, see `Bra86.c`.

use core::fmt::{self, Display};
use std::io;

use log::debug;
use mu_rust_helpers::uefi_decompress::{DecompressionAlgorithm, decompress_into_with_algo};
use strum::Display as StrDisplay;

#[derive(StrDisplay, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
    #[strum(serialize = "EFI 1.1")]
    Efi,
    #[strum(serialize = "Tiano")]
    Tiano,
    #[strum(serialize = "LZMA")]
    Lzma,
    #[strum(serialize = "LZMA F86")]
    LzmaF86,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecompressError {
    Truncated(usize),
    TooLarge(usize),
    Corrupt(String),
}

impl Display for DecompressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecompressError::Truncated(l) => write!(f, "input of {l} bytes is too short"),
            DecompressError::TooLarge(s) => write!(f, "decompressed size {s:08x} exceeds limit"),
            DecompressError::Corrupt(m) => write!(f, "corrupt stream: {m}"),
        }
    }
}

/// Size of the EFI/Tiano container header
const EFI_HEADER_SIZE: usize = 8;
/// Size of the `.lzma` header: properties, dictionary size, unpacked size
const LZMA_HEADER_SIZE: usize = 13;

pub fn decompress(src: &[u8], algorithm: Algorithm, max: usize) -> Result<Vec<u8>, DecompressError> {
    match algorithm {
        Algorithm::Efi | Algorithm::Tiano => efi_decompress(src, algorithm, max),
        Algorithm::Lzma => lzma_decompress(src, max),
        Algorithm::LzmaF86 => {
            let mut out = lzma_decompress(src, max)?;
            let mut state = 0;
            x86_convert(&mut out, 0, &mut state, false);
            Ok(out)
        }
    }
}

fn efi_decompress(src: &[u8], algorithm: Algorithm, max: usize) -> Result<Vec<u8>, DecompressError> {
    let l = src.len();
    if l < EFI_HEADER_SIZE {
        return Err(DecompressError::Truncated(l));
    }
    let compressed_size = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
    let size = u32::from_le_bytes([src[4], src[5], src[6], src[7]]) as usize;
    if compressed_size.saturating_add(EFI_HEADER_SIZE) > l {
        return Err(DecompressError::Corrupt(format!(
            "compressed size {compressed_size:08x} exceeds input of {l:08x} bytes"
        )));
    }
    if size > max {
        return Err(DecompressError::TooLarge(size));
    }
    let algo = match algorithm {
        Algorithm::Tiano => DecompressionAlgorithm::TianoDecompress,
        _ => DecompressionAlgorithm::UefiDecompress,
    };
    let mut out = vec![0u8; size];
    decompress_into_with_algo(src, &mut out, algo)
        .map_err(|_| DecompressError::Corrupt(format!("{algorithm} decoding failed")))?;
    debug!("{algorithm}: {compressed_size:08x} -> {size:08x} bytes");
    Ok(out)
}

fn lzma_decompress(src: &[u8], max: usize) -> Result<Vec<u8>, DecompressError> {
    let l = src.len();
    if l < LZMA_HEADER_SIZE {
        return Err(DecompressError::Truncated(l));
    }
    let mut s = [0u8; 8];
    s.copy_from_slice(&src[5..13]);
    // All 1's means the size is unknown and the stream has an end marker.
    let size = u64::from_le_bytes(s);
    if size != u64::MAX && size > max as u64 {
        return Err(DecompressError::TooLarge(size as usize));
    }
    let mut input = src;
    let mut sink = BoundedSink {
        out: Vec::new(),
        max,
        overflow: None,
    };
    // The dictionary buffer never holds more than the output, so `max`
    // bounds it as well.
    let options = lzma_rs::decompress::Options {
        memlimit: Some(max),
        ..Default::default()
    };
    if let Err(e) = lzma_rs::lzma_decompress_with_options(&mut input, &mut sink, &options) {
        if let Some(size) = sink.overflow {
            return Err(DecompressError::TooLarge(size));
        }
        return Err(match e {
            lzma_rs::error::Error::LzmaError(m) if m.contains("memory limit") => {
                DecompressError::TooLarge(max.saturating_add(1))
            }
            e => DecompressError::Corrupt(format!("{e:?}")),
        });
    }
    let out = sink.out;
    debug!("LZMA: {l:08x} -> {:08x} bytes", out.len());
    Ok(out)
}

/// Collects decoder output, failing once more than `max` bytes arrive.
struct BoundedSink {
    out: Vec<u8>,
    max: usize,
    /// Size the output would have grown to
    overflow: Option<usize>,
}

impl io::Write for BoundedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let total = self.out.len() + buf.len();
        if total > self.max {
            self.overflow = Some(total);
            return Err(io::Error::other(format!("output exceeds {:08x} bytes", self.max)));
        }
        self.out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn test_ms_byte(b: u8) -> bool {
    b == 0 || b == 0xff
}

/// x86 BCJ filter; converts relative CALL/JMP targets back to (`encoding` =
/// false) or from absolute ones. Returns the number of bytes processed.
pub fn x86_convert(data: &mut [u8], ip: u32, state: &mut u32, encoding: bool) -> usize {
    const MASK_TO_ALLOWED_STATUS: [bool; 8] = [true, true, true, false, true, false, false, false];
    const MASK_TO_BIT_NUMBER: [u32; 8] = [0, 1, 2, 2, 3, 3, 3, 3];

    let size = data.len();
    if size < 5 {
        return 0;
    }
    let ip = ip.wrapping_add(5);
    let limit = size - 4;
    let mut pos = 0usize;
    let mut prev_pos = usize::MAX;
    let mut prev_mask = *state & 7;

    loop {
        while pos < limit && data[pos] & 0xfe != 0xe8 {
            pos += 1;
        }
        if pos >= limit {
            break;
        }
        let d = pos.wrapping_sub(prev_pos);
        if d > 3 {
            prev_mask = 0;
        } else {
            prev_mask = (prev_mask << (d - 1)) & 7;
            if prev_mask != 0 {
                let b = data[pos + 4 - MASK_TO_BIT_NUMBER[prev_mask as usize] as usize];
                if !MASK_TO_ALLOWED_STATUS[prev_mask as usize] || test_ms_byte(b) {
                    prev_pos = pos;
                    prev_mask = ((prev_mask << 1) & 7) | 1;
                    pos += 1;
                    continue;
                }
            }
        }
        prev_pos = pos;

        if test_ms_byte(data[pos + 4]) {
            let mut src = u32::from_le_bytes([data[pos + 1], data[pos + 2], data[pos + 3], data[pos + 4]]);
            let mut dest;
            loop {
                let cur = ip.wrapping_add(pos as u32);
                dest = if encoding {
                    cur.wrapping_add(src)
                } else {
                    src.wrapping_sub(cur)
                };
                if prev_mask == 0 {
                    break;
                }
                let index = MASK_TO_BIT_NUMBER[prev_mask as usize] * 8;
                let b = (dest >> (24 - index)) as u8;
                if !test_ms_byte(b) {
                    break;
                }
                src = dest ^ ((1u32 << (32 - index)) - 1);
            }
            data[pos + 4] = !(((dest >> 24) & 1).wrapping_sub(1)) as u8;
            data[pos + 3] = (dest >> 16) as u8;
            data[pos + 2] = (dest >> 8) as u8;
            data[pos + 1] = dest as u8;
            pos += 5;
        } else {
            prev_mask = ((prev_mask << 1) & 7) | 1;
            pos += 1;
        }
    }

    let d = pos.wrapping_sub(prev_pos);
    *state = if d > 3 { 0 } else { (prev_mask << (d - 1)) & 7 };
    pos
}

#[test]
fn lzma_roundtrip_through_compressor() {
    let data: Vec<u8> = b"firmware volume ".iter().copied().cycle().take(512).collect();
    let mut packed = Vec::new();
    lzma_rs::lzma_compress(&mut &data[..], &mut packed).unwrap();
    let out = decompress(&packed, Algorithm::Lzma, 0x1000).unwrap();
    assert_eq!(out, data);
    assert!(matches!(
        decompress(&packed, Algorithm::Lzma, 16),
        Err(DecompressError::TooLarge(_))
    ));
}

#[test]
fn lzma_without_size_stays_bounded() {
    let zeros = vec![0u8; 0x1000];
    let mut packed = Vec::new();
    lzma_rs::lzma_compress(&mut &zeros[..], &mut packed).unwrap();
    // the stream carries no size, only an end marker
    assert_eq!(&packed[5..13], &[0xff; 8]);
    match decompress(&packed, Algorithm::Lzma, 0x400) {
        Err(DecompressError::TooLarge(s)) => assert!(s > 0x400),
        r => panic!("unexpected result {r:?}"),
    }
    assert_eq!(decompress(&packed, Algorithm::Lzma, 0x1000), Ok(zeros));
}

#[test]
fn efi_header_sanity() {
    assert_eq!(
        decompress(&[1, 2, 3], Algorithm::Efi, 0x1000),
        Err(DecompressError::Truncated(3))
    );
    // compressed size larger than the input
    let src = [0xff, 0, 0, 0, 0x10, 0, 0, 0, 0, 0];
    assert!(matches!(
        decompress(&src, Algorithm::Tiano, 0x1000),
        Err(DecompressError::Corrupt(_))
    ));
    let src = [0x02, 0, 0, 0, 0, 0, 0, 0x10, 0, 0];
    assert!(matches!(
        decompress(&src, Algorithm::Efi, 0x1000),
        Err(DecompressError::TooLarge(_))
    ));
}

#[test]
fn bcj_x86_restores_calls() {
    // call rel32, nop, call rel32, jmp rel32 (0xe9), padding
    let orig: Vec<u8> = [
        &[0x90, 0xe8, 0x10, 0x00, 0x00, 0x00][..],
        &[0x90, 0x90, 0x90, 0x90][..],
        &[0xe8, 0xf0, 0xff, 0xff, 0xff][..],
        &[0x90; 16][..],
        &[0xe9, 0x00, 0x01, 0x00, 0x00][..],
        &[0x90; 8][..],
    ]
    .concat();
    let mut data = orig.clone();
    let mut state = 0;
    x86_convert(&mut data, 0, &mut state, true);
    assert_ne!(data, orig);
    // First call target becomes absolute: 0x10 + (1 + 5)
    assert_eq!(&data[1..6], &[0xe8, 0x16, 0x00, 0x00, 0x00]);
    let mut state = 0;
    x86_convert(&mut data, 0, &mut state, false);
    assert_eq!(data, orig);
}
