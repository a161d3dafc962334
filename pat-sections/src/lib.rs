//! The section model backing every read and write the evaluator performs:
//! a uniform bounds-checked interface over the main input, the heap,
//! pattern-local scratch, and user-composed memory views.

pub mod error;

use pat_tree::SectionId;

pub use error::IoError;

/// Describes whether a byte range is backed by real data, for
/// tooling-facing presentation of a section's layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Mapped,
    Unmapped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAttribute {
    pub offset: u64,
    pub length: u64,
    pub kind: ChunkKind,
}

/// A byte-addressable memory region. Implementors provide the `_raw`
/// methods; bounds checking lives once in the trait's default `read`/
/// `write`.
pub trait Section {
    fn raw_size(&self) -> u64;
    fn resize_raw(&mut self, new_size: u64) -> Result<(), IoError>;
    fn read_raw(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), IoError>;
    fn write_raw(&mut self, offset: u64, data: &[u8]) -> Result<(), IoError>;

    fn read_chunk_attributes(&self, offset: u64, length: u64) -> Vec<ChunkAttribute> {
        vec![ChunkAttribute { offset, length, kind: ChunkKind::Mapped }]
    }

    fn size(&self) -> u64 {
        self.raw_size()
    }

    fn resize(&mut self, new_size: u64) -> Result<(), IoError> {
        self.resize_raw(new_size)
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), IoError> {
        let size = self.raw_size();
        let length = buf.len() as u64;
        let end = offset.checked_add(length).ok_or(IoError::OutOfBounds { offset, length, size })?;
        if end > size {
            return Err(IoError::OutOfBounds { offset, length, size });
        }
        self.read_raw(offset, buf)
    }

    fn write(&mut self, offset: u64, data: &[u8], expand: bool) -> Result<(), IoError> {
        let size = self.raw_size();
        let length = data.len() as u64;
        let end = offset.checked_add(length).ok_or(IoError::OutOfBounds { offset, length, size })?;
        if end > size {
            if !expand {
                return Err(IoError::OutOfBounds { offset, length, size });
            }
            log::debug!("expanding section from {size} to {end} bytes for a write at {offset}");
            self.resize_raw(end)?;
        }
        self.write_raw(offset, data)
    }
}

/// Zero bytes, refuses all I/O. Used as the default for unconfigured
/// well-known sections and for `PatternLocalSection` before first use.
#[derive(Debug, Default)]
pub struct EmptySection;

impl Section for EmptySection {
    fn raw_size(&self) -> u64 {
        0
    }

    fn resize_raw(&mut self, requested: u64) -> Result<(), IoError> {
        Err(IoError::ResizeRefused { requested })
    }

    fn read_raw(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), IoError> {
        Err(IoError::OutOfBounds { offset, length: buf.len() as u64, size: 0 })
    }

    fn write_raw(&mut self, _offset: u64, _data: &[u8]) -> Result<(), IoError> {
        Err(IoError::ReadOnly)
    }
}

/// Wraps any section and refuses every write, regardless of what the inner
/// section would otherwise allow. Used for `MainSection`: the input data is
/// read-only from the pattern program's point of view.
pub struct ReadOnlySection<S: Section>(pub S);

impl<S: Section> Section for ReadOnlySection<S> {
    fn raw_size(&self) -> u64 {
        self.0.raw_size()
    }

    fn resize_raw(&mut self, requested: u64) -> Result<(), IoError> {
        let _ = requested;
        Err(IoError::ReadOnly)
    }

    fn read_raw(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), IoError> {
        self.0.read_raw(offset, buf)
    }

    fn write_raw(&mut self, _offset: u64, _data: &[u8]) -> Result<(), IoError> {
        Err(IoError::ReadOnly)
    }

    fn read_chunk_attributes(&self, offset: u64, length: u64) -> Vec<ChunkAttribute> {
        self.0.read_chunk_attributes(offset, length)
    }
}

/// A logically `size`-byte region that reads as all zeros and refuses
/// writes. Used for `InstantiationSection`, which only needs extent.
#[derive(Debug)]
pub struct ZerosSection {
    size: u64,
}

impl ZerosSection {
    pub fn new(size: u64) -> Self {
        Self { size }
    }
}

impl Section for ZerosSection {
    fn raw_size(&self) -> u64 {
        self.size
    }

    fn resize_raw(&mut self, requested: u64) -> Result<(), IoError> {
        Err(IoError::ResizeRefused { requested })
    }

    fn read_raw(&mut self, _offset: u64, buf: &mut [u8]) -> Result<(), IoError> {
        buf.fill(0);
        Ok(())
    }

    fn write_raw(&mut self, _offset: u64, _data: &[u8]) -> Result<(), IoError> {
        Err(IoError::ReadOnly)
    }
}

/// A plain growable byte buffer bounded by `max_size`. Backs the heap and
/// pattern-local scratch sections.
#[derive(Debug)]
pub struct InMemorySection {
    data: Vec<u8>,
    max_size: u64,
}

impl InMemorySection {
    pub fn new(max_size: u64) -> Self {
        Self { data: Vec::new(), max_size }
    }

    pub fn with_data(data: Vec<u8>, max_size: u64) -> Self {
        Self { data, max_size }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Section for InMemorySection {
    fn raw_size(&self) -> u64 {
        self.data.len() as u64
    }

    fn resize_raw(&mut self, new_size: u64) -> Result<(), IoError> {
        if new_size > self.max_size {
            return Err(IoError::MaxSizeExceeded {
                offset: 0,
                length: new_size.saturating_sub(self.data.len() as u64),
                max_size: self.max_size,
            });
        }
        self.data.resize(new_size as usize, 0);
        Ok(())
    }

    fn read_raw(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), IoError> {
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_raw(&mut self, offset: u64, data: &[u8]) -> Result<(), IoError> {
        let start = offset as usize;
        self.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Wraps user-provided reader/writer callbacks (the embedding application's
/// `DataSource`) with a reentrancy guard. `resize` is always refused: the
/// data source's extent is owned by the embedder.
pub struct DataSourceSection {
    size: u64,
    reader: Box<dyn FnMut(u64, &mut [u8]) -> Result<(), IoError>>,
    writer: Option<Box<dyn FnMut(u64, &[u8]) -> Result<(), IoError>>>,
    in_flight: bool,
}

impl DataSourceSection {
    pub fn new_read_only(size: u64, reader: Box<dyn FnMut(u64, &mut [u8]) -> Result<(), IoError>>) -> Self {
        Self { size, reader, writer: None, in_flight: false }
    }

    pub fn new_read_write(
        size: u64,
        reader: Box<dyn FnMut(u64, &mut [u8]) -> Result<(), IoError>>,
        writer: Box<dyn FnMut(u64, &[u8]) -> Result<(), IoError>>,
    ) -> Self {
        Self { size, reader, writer: Some(writer), in_flight: false }
    }
}

impl Section for DataSourceSection {
    fn raw_size(&self) -> u64 {
        self.size
    }

    fn resize_raw(&mut self, requested: u64) -> Result<(), IoError> {
        Err(IoError::ResizeRefused { requested })
    }

    fn read_raw(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), IoError> {
        if self.in_flight {
            return Err(IoError::Reentrant);
        }
        self.in_flight = true;
        let result = (self.reader)(offset, buf);
        self.in_flight = false;
        result
    }

    fn write_raw(&mut self, offset: u64, data: &[u8]) -> Result<(), IoError> {
        if self.in_flight {
            return Err(IoError::Reentrant);
        }
        let Some(writer) = self.writer.as_mut() else {
            return Err(IoError::ReadOnly);
        };
        self.in_flight = true;
        let result = writer(offset, data);
        self.in_flight = false;
        result
    }
}

/// One entry in a [`ViewSection`]'s span map: the view's `offset` range
/// `[offset, offset + size)` is backed by `section_id` starting at `base`.
#[derive(Debug, Clone, Copy)]
pub struct Span {
    pub section_id: SectionId,
    pub base: u64,
    pub size: u64,
}

/// An ordered composition of spans from other sections, with gaps exposed
/// as unmapped. Views are non-recursive: a single in-flight access flag
/// rejects an access that would re-enter the view while resolving a span.
#[derive(Debug, Default)]
pub struct ViewSection {
    spans: std::collections::BTreeMap<u64, Span>,
    size: u64,
    in_flight: bool,
}

impl ViewSection {
    pub fn new(size: u64) -> Self {
        Self { spans: std::collections::BTreeMap::new(), size, in_flight: false }
    }

    pub fn map(&mut self, offset: u64, span: Span) {
        self.spans.insert(offset, span);
        self.size = self.size.max(offset + span.size);
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Finds the span covering `offset`, or the nearest span at or after
    /// `offset` to use as the "nearest mapped span" hint on a gap error.
    fn span_at(&self, offset: u64) -> Option<(&u64, &Span)> {
        self.spans.range(..=offset).next_back().filter(|(start, span)| offset < **start + span.size)
    }

    fn nearest_hint(&self, offset: u64) -> u64 {
        self.spans.range(offset..).next().map(|(start, _)| *start).unwrap_or(self.size)
    }

    /// Reads `buf.len()` bytes starting at `offset`, dispatching each
    /// covered span to `resolve` (typically the evaluator's section table).
    pub fn read_through(
        &mut self,
        offset: u64,
        buf: &mut [u8],
        mut resolve: impl FnMut(SectionId, u64, &mut [u8]) -> Result<(), IoError>,
    ) -> Result<(), IoError> {
        if self.in_flight {
            return Err(IoError::Reentrant);
        }
        self.in_flight = true;
        let result = self.walk(offset, buf.len() as u64, |span, rel_offset, len| {
            resolve(span.section_id, span.base + rel_offset, &mut buf[(rel_offset) as usize..][..len as usize])
        });
        self.in_flight = false;
        result
    }

    pub fn write_through(
        &mut self,
        offset: u64,
        data: &[u8],
        mut resolve: impl FnMut(SectionId, u64, &[u8]) -> Result<(), IoError>,
    ) -> Result<(), IoError> {
        if self.in_flight {
            return Err(IoError::Reentrant);
        }
        self.in_flight = true;
        let result = self.walk(offset, data.len() as u64, |span, rel_offset, len| {
            resolve(span.section_id, span.base + rel_offset, &data[(rel_offset) as usize..][..len as usize])
        });
        self.in_flight = false;
        result
    }

    fn walk(
        &self,
        offset: u64,
        length: u64,
        mut on_span: impl FnMut(&Span, u64, u64) -> Result<(), IoError>,
    ) -> Result<(), IoError> {
        let mut cursor = offset;
        let end = offset + length;
        while cursor < end {
            let Some((start, span)) = self.span_at(cursor) else {
                return Err(IoError::UnmappedGap { offset: cursor, hint: self.nearest_hint(cursor) });
            };
            let span_end = start + span.size;
            let chunk_len = (span_end.min(end) - cursor).min(end - cursor);
            on_span(span, cursor - start, chunk_len)?;
            cursor += chunk_len;
        }
        Ok(())
    }

    pub fn read_chunk_attributes(&self, offset: u64, length: u64) -> Vec<ChunkAttribute> {
        let mut attrs = Vec::new();
        let mut cursor = offset;
        let end = offset + length;
        while cursor < end {
            match self.span_at(cursor) {
                Some((start, span)) => {
                    let span_end = start + span.size;
                    let chunk_len = span_end.min(end) - cursor;
                    attrs.push(ChunkAttribute { offset: cursor, length: chunk_len, kind: ChunkKind::Mapped });
                    cursor += chunk_len;
                }
                None => {
                    let hint = self.nearest_hint(cursor);
                    let chunk_len = hint.min(end) - cursor;
                    attrs.push(ChunkAttribute { offset: cursor, length: chunk_len.max(1), kind: ChunkKind::Unmapped });
                    cursor += chunk_len.max(1);
                }
            }
        }
        attrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_section_passes_reads_and_refuses_writes() {
        let mut s = ReadOnlySection(InMemorySection::with_data(vec![1, 2, 3, 4], 4));
        let mut buf = [0u8; 4];
        s.read(0, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert!(matches!(s.write(0, &[9], false), Err(IoError::ReadOnly)));
        assert!(matches!(s.resize(8), Err(IoError::ReadOnly)));
    }

    #[test]
    fn empty_section_refuses_everything() {
        let mut s = EmptySection;
        let mut buf = [0u8; 1];
        assert!(s.read(0, &mut buf).is_err());
        assert!(s.write(0, &[1], false).is_err());
    }

    #[test]
    fn zeros_section_reads_zero_and_refuses_writes() {
        let mut s = ZerosSection::new(16);
        let mut buf = [0xffu8; 4];
        s.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0, 0]);
        assert!(s.write(0, &[1], false).is_err());
        assert!(s.read(15, &mut [0u8; 2]).is_err());
    }

    #[test]
    fn in_memory_section_grows_on_expand_and_respects_max_size() {
        let mut s = InMemorySection::new(8);
        s.write(0, &[1, 2, 3, 4], true).unwrap();
        assert_eq!(s.size(), 4);
        assert!(s.write(4, &[5, 6, 7, 8, 9], true).is_err());
        s.write(4, &[5, 6, 7, 8], true).unwrap();
        let mut buf = [0u8; 8];
        s.read(0, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn in_memory_section_refuses_write_past_end_without_expand() {
        let mut s = InMemorySection::new(8);
        s.resize(4).unwrap();
        assert!(s.write(0, &[1, 2, 3, 4, 5], false).is_err());
    }

    #[test]
    fn view_section_walks_spans_and_reports_gaps() {
        let mut view = ViewSection::new(0);
        view.map(0, Span { section_id: 1, base: 0, size: 4 });
        view.map(8, Span { section_id: 2, base: 100, size: 4 });

        let mut backing: std::collections::HashMap<SectionId, Vec<u8>> =
            std::collections::HashMap::from([(1, vec![0xAA; 4]), (2, vec![0xBB; 200])]);

        let mut buf = [0u8; 4];
        view.read_through(0, &mut buf, |sid, off, dst| {
            let src = &backing.get_mut(&sid).unwrap()[off as usize..][..dst.len()];
            dst.copy_from_slice(src);
            Ok(())
        })
        .unwrap();
        assert_eq!(buf, [0xAA; 4]);

        let err = view.read_through(4, &mut [0u8; 2], |sid, off, dst| {
            let src = &backing.get_mut(&sid).unwrap()[off as usize..][..dst.len()];
            dst.copy_from_slice(src);
            Ok(())
        });
        assert!(matches!(err, Err(IoError::UnmappedGap { .. })));
    }
}
