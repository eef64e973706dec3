//! Property tests for zero-copy block delivery.

use std::cell::RefCell;
use std::io::Cursor;
use std::rc::Rc;

use proptest::prelude::*;

use arcio::{Entry, FilterSpec, FormatSpec, ReaderBuilder, Sink, Source, WriterBuilder};

struct Capture(Rc<RefCell<Vec<u8>>>);

impl Sink for Capture {
    fn write(&mut self, b: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(b);
        Ok(b.len())
    }
}

struct MemSource(Cursor<Vec<u8>>);

impl Source for MemSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        std::io::Read::read(&mut self.0, buf)
    }
}

fn body_of(len: usize, seed: u64) -> Vec<u8> {
    // xorshift fill keeps the generated cases cheap even at large sizes.
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

fn archive_of(format: FormatSpec, filter: FilterSpec, bodies: &[Vec<u8>]) -> Vec<u8> {
    let buf = Rc::new(RefCell::new(Vec::new()));
    let mut w = WriterBuilder::new(format)
        .filter(filter)
        .open(Box::new(Capture(buf.clone())))
        .unwrap();
    for (i, body) in bodies.iter().enumerate() {
        w.write_header(&Entry::regular(format!("f{i}"), body.len() as u64))
            .unwrap();
        w.write_data(body).unwrap();
        w.finish_entry().unwrap();
    }
    w.close().unwrap();
    let out = buf.borrow().clone();
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Block offsets are strictly increasing, ranges disjoint and gap-free,
    /// and their union is exactly the declared body.
    #[test]
    fn blocks_tile_the_body_exactly(
        lens in prop::collection::vec(0usize..150_000, 1..4),
        seed in any::<u64>(),
        format_pick in 0usize..2,
        gzip in any::<bool>(),
    ) {
        let format = [FormatSpec::Tar, FormatSpec::Cpio][format_pick];
        let filter = if gzip { FilterSpec::Gzip } else { FilterSpec::None };
        let bodies: Vec<Vec<u8>> = lens
            .iter()
            .enumerate()
            .map(|(i, &l)| body_of(l, seed ^ i as u64))
            .collect();
        let bytes = archive_of(format, filter, &bodies);

        let mut r = ReaderBuilder::new()
            .open(Box::new(MemSource(Cursor::new(bytes))))
            .unwrap();
        for body in &bodies {
            let declared = r.next_header().unwrap().expect("entry").size();
            prop_assert_eq!(declared, body.len() as u64);

            let mut rebuilt = Vec::with_capacity(body.len());
            let mut next_offset = 0u64;
            while let Some((off, chunk)) = r.read_data_block().unwrap() {
                prop_assert_eq!(off, next_offset);
                prop_assert!(!chunk.is_empty());
                next_offset = off + chunk.len() as u64;
                prop_assert!(next_offset <= declared);
                rebuilt.extend_from_slice(chunk);
            }
            prop_assert_eq!(next_offset, declared);
            prop_assert_eq!(&rebuilt, body);
        }
        prop_assert!(r.next_header().unwrap().is_none());
        r.close().unwrap();
    }

    /// Copying reads and zero-copy reads agree on the same archive.
    #[test]
    fn read_data_matches_read_data_block(
        len in 0usize..100_000,
        seed in any::<u64>(),
        chunk_len in 1usize..9000,
    ) {
        let body = body_of(len, seed);
        let bytes = archive_of(FormatSpec::Tar, FilterSpec::None, &[body.clone()]);

        let mut copied = Vec::with_capacity(len);
        let mut r = ReaderBuilder::new()
            .open(Box::new(MemSource(Cursor::new(bytes.clone()))))
            .unwrap();
        r.next_header().unwrap().expect("entry");
        let mut buf = vec![0u8; chunk_len];
        loop {
            let n = r.read_data(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            copied.extend_from_slice(&buf[..n]);
        }
        r.close().unwrap();

        let mut blocks = Vec::with_capacity(len);
        let mut r = ReaderBuilder::new()
            .open(Box::new(MemSource(Cursor::new(bytes))))
            .unwrap();
        r.next_header().unwrap().expect("entry");
        while let Some((_, chunk)) = r.read_data_block().unwrap() {
            blocks.extend_from_slice(chunk);
        }
        r.close().unwrap();

        prop_assert_eq!(&copied, &body);
        prop_assert_eq!(&blocks, &body);
    }
}
