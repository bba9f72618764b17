use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use flate2::read::MultiGzDecoder;

use crate::types::ReadSet;

/// Open a FASTQ file, transparently decompressing `.gz`.
pub fn open_fastq(path: &Path) -> io::Result<Box<dyn BufRead>> {
    let f = File::open(path)?;

    let is_gz = path
        .extension()
        .map(|ext| ext == "gz")
        .unwrap_or(false);

    let reader: Box<dyn BufRead> = if is_gz {
        Box::new(BufReader::new(MultiGzDecoder::new(f)))
    } else {
        Box::new(BufReader::new(f))
    };
    Ok(reader)
}

/// Count records in a FASTQ file. Stops early once `limit` is reached.
///
/// Records are 4 lines starting with `@`; truncated trailing records are not
/// counted.
pub fn count_records_up_to(path: &Path, limit: Option<u64>) -> io::Result<u64> {
    let mut reader = open_fastq(path)?;
    let mut line = String::new();
    let mut count = 0u64;

    loop {
        if limit.is_some_and(|l| count >= l) {
            break;
        }
        // 1) header
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        if !line.starts_with('@') {
            // blank line or junk between records
            continue;
        }
        // 2) sequence, 3) plus line, 4) quality
        let mut complete = true;
        for _ in 0..3 {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                complete = false;
                break;
            }
        }
        if !complete {
            break;
        }
        count += 1;
    }

    Ok(count)
}

pub fn count_records(path: &Path) -> io::Result<u64> {
    count_records_up_to(path, None)
}

/// True when the file holds at least one complete record.
pub fn has_records(path: &Path) -> io::Result<bool> {
    Ok(count_records_up_to(path, Some(1))? > 0)
}

/// Reads (pairs for paired input) in a read set. Mates are counted once.
pub fn count_read_set(reads: &ReadSet) -> io::Result<u64> {
    match reads {
        ReadSet::Single { reads } => count_records(reads),
        ReadSet::Paired { r1, .. } => count_records(r1),
    }
}
