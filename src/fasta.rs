use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use ahash::AHashMap;
use flate2::read::MultiGzDecoder;
use parking_lot::Mutex;

use crate::error::{CurateError, Result};
use crate::types::SequenceRecord;

/// Random access to sequences by id. Filter jobs call `fetch` concurrently.
pub trait SequenceSource: Send + Sync {
    /// Returns the sequences for `ids`, in the same order.
    /// A missing id is a `DataIntegrity` error.
    fn fetch(&self, ids: &[String]) -> Result<Vec<SequenceRecord>>;
}

/// Minimal FASTA reader that also supports .gz
pub fn read_fasta_records<P: AsRef<Path>>(path: P) -> Result<Vec<SequenceRecord>> {
    let path = path.as_ref();
    let f = File::open(path)?;

    let is_gz = path.extension().map(|ext| ext == "gz").unwrap_or(false);

    let reader: Box<dyn BufRead> = if is_gz {
        Box::new(BufReader::new(MultiGzDecoder::new(f)))
    } else {
        Box::new(BufReader::new(f))
    };

    parse_fasta(reader)
}

/// Parses FASTA from any buffered reader. Residue lines are concatenated.
pub fn parse_fasta<R: BufRead>(mut reader: R) -> Result<Vec<SequenceRecord>> {
    let mut sequences = Vec::new();
    let mut current: Option<SequenceRecord> = None;
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break; // EOF
        }
        let trimmed = line.trim_end();
        if let Some(header) = trimmed.strip_prefix('>') {
            if let Some(done) = current.take() {
                sequences.push(done);
            }
            current = Some(parse_header(header));
        } else if let Some(rec) = current.as_mut() {
            rec.residues.push_str(trimmed.trim());
        } else if !trimmed.trim().is_empty() {
            return Err(CurateError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "FASTA residues before the first header",
            )));
        }
    }
    if let Some(done) = current {
        sequences.push(done);
    }

    Ok(sequences)
}

fn parse_header(header: &str) -> SequenceRecord {
    let mut parts = header.splitn(2, char::is_whitespace);
    let id = parts.next().unwrap_or("").to_string();
    let description = parts.next().unwrap_or("").trim().to_string();
    SequenceRecord {
        id,
        description,
        residues: String::new(),
    }
}

/// Writes records as unwrapped FASTA.
pub fn write_fasta<'a, W, I>(mut writer: W, records: I) -> Result<usize>
where
    W: Write,
    I: IntoIterator<Item = &'a SequenceRecord>,
{
    let mut n = 0;
    for rec in records {
        if rec.description.is_empty() {
            writeln!(writer, ">{}\n{}", rec.id, rec.residues)?;
        } else {
            writeln!(writer, ">{} {}\n{}", rec.id, rec.description, rec.residues)?;
        }
        n += 1;
    }
    writer.flush()?;
    Ok(n)
}

fn missing(id: &str) -> CurateError {
    CurateError::DataIntegrity(format!("sequence {id} not found in sequence source"))
}

/// All sequences held in memory.
#[derive(Debug, Default, Clone)]
pub struct InMemorySource {
    records: AHashMap<String, SequenceRecord>,
}

impl InMemorySource {
    pub fn new<I: IntoIterator<Item = SequenceRecord>>(records: I) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.id.clone(), r)).collect(),
        }
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(read_fasta_records(path)?))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl SequenceSource for InMemorySource {
    fn fetch(&self, ids: &[String]) -> Result<Vec<SequenceRecord>> {
        ids.iter()
            .map(|id| self.records.get(id).cloned().ok_or_else(|| missing(id)))
            .collect()
    }
}

/// An uncompressed FASTA file with a byte-offset index built in one scan.
/// One file handle is shared by all callers; seek+read happen under a lock.
pub struct IndexedFasta {
    path: PathBuf,
    /// id -> (offset of the header line, length in bytes of the whole record)
    offsets: AHashMap<String, (u64, u64)>,
    file: Mutex<File>,
}

impl IndexedFasta {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut reader = BufReader::new(File::open(&path)?);
        let mut offsets = AHashMap::new();
        let mut line = String::new();
        let mut pos = 0u64;
        let mut open: Option<(String, u64)> = None;

        loop {
            line.clear();
            let n = reader.read_line(&mut line)? as u64;
            if n == 0 {
                break;
            }
            if let Some(header) = line.strip_prefix('>') {
                if let Some((id, start)) = open.take() {
                    offsets.insert(id, (start, pos - start));
                }
                open = Some((parse_header(header.trim_end()).id, pos));
            }
            pos += n;
        }
        if let Some((id, start)) = open {
            offsets.insert(id, (start, pos - start));
        }

        log::debug!("Indexed {} sequences in {}", offsets.len(), path.display());
        let file = Mutex::new(File::open(&path)?);
        Ok(Self { path, offsets, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.offsets.contains_key(id)
    }

    fn read_record(&self, offset: u64, len: u64) -> Result<SequenceRecord> {
        let mut buf = vec![0u8; len as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf)?;
        }
        parse_fasta(&buf[..])?.into_iter().next().ok_or_else(|| {
            CurateError::DataIntegrity(format!("empty record at offset {offset} in {}", self.path.display()))
        })
    }
}

impl SequenceSource for IndexedFasta {
    fn fetch(&self, ids: &[String]) -> Result<Vec<SequenceRecord>> {
        ids.iter()
            .map(|id| {
                let &(offset, len) = self.offsets.get(id).ok_or_else(|| missing(id))?;
                self.read_record(offset, len)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const FASTA: &str = ">a first one\nACGT\nACGT\n>b\nTTTT\n\n>c\nGG\n";

    #[test]
    fn parses_multiline_records() {
        let recs = parse_fasta(FASTA.as_bytes()).unwrap();
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[0].id, "a");
        assert_eq!(recs[0].description, "first one");
        assert_eq!(recs[0].residues, "ACGTACGT");
        assert_eq!(recs[2].residues, "GG");
    }

    #[test]
    fn write_then_parse_keeps_descriptions() {
        let recs = parse_fasta(FASTA.as_bytes()).unwrap();
        let mut out = Vec::new();
        assert_eq!(write_fasta(&mut out, &recs).unwrap(), 3);
        assert!(String::from_utf8(out).unwrap().starts_with(">a first one\nACGTACGT\n"));
    }

    #[test]
    fn in_memory_source_reports_missing_ids() {
        let src = InMemorySource::new(parse_fasta(FASTA.as_bytes()).unwrap());
        let got = src.fetch(&["c".into(), "a".into()]).unwrap();
        assert_eq!(got[0].id, "c");
        assert_eq!(got[1].id, "a");
        assert!(matches!(src.fetch(&["zz".into()]), Err(CurateError::DataIntegrity(_))));
    }

    #[test]
    fn indexed_fasta_serves_concurrent_fetches() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(FASTA.as_bytes()).unwrap();
        tmp.flush().unwrap();

        let src = Arc::new(IndexedFasta::open(tmp.path()).unwrap());
        assert_eq!(src.len(), 3);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let src = Arc::clone(&src);
                std::thread::spawn(move || src.fetch(&["b".into(), "a".into()]).unwrap())
            })
            .collect();
        for h in handles {
            let recs = h.join().unwrap();
            assert_eq!(recs[0].residues, "TTTT");
            assert_eq!(recs[1].residues, "ACGTACGT");
        }
    }
}
