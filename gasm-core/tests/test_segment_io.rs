// Segment file tests
// Plain and gzip segment files on disk, and assembling straight from a file

use std::fs::{self, File};
use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use gasm_core::{read_segments, sliding_windows, write_fasta, write_segments, Assembler};
use tempfile::TempDir;

#[test]
fn test_plain_file_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("segments.txt");
    let segments = sliding_windows(b"gatcggcagc", 4).unwrap();

    write_segments(File::create(&path).unwrap(), &segments).unwrap();
    assert_eq!(read_segments(&path).unwrap(), segments);
}

#[test]
fn test_gzip_file_is_detected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("segments.txt.gz");

    let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
    encoder.write_all(b"# sampled from gatcggcagc\ngatc\natcg\n\ntcgg\n").unwrap();
    encoder.finish().unwrap();

    let segments = read_segments(&path).unwrap();
    assert_eq!(segments, vec![b"gatc".to_vec(), b"atcg".to_vec(), b"tcgg".to_vec()]);
}

#[test]
fn test_concatenated_gzip_members() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("members.gz");
    let mut file = File::create(&path).unwrap();

    for chunk in [&b"gatc\natcg\n"[..], b"tcgg\n"] {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(chunk).unwrap();
        file.write_all(&encoder.finish().unwrap()).unwrap();
    }
    drop(file);

    assert_eq!(read_segments(&path).unwrap().len(), 3);
}

#[test]
fn test_short_file_is_plain() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("one.txt");
    fs::write(&path, "a").unwrap();

    assert_eq!(read_segments(&path).unwrap(), vec![b"a".to_vec()]);
}

#[test]
fn test_mixed_lengths_error_names_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.txt");
    fs::write(&path, "gatc\natc\n").unwrap();

    let err = read_segments(&path).unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("bad.txt"), "{message}");
    assert!(message.contains("line 2"), "{message}");
}

#[test]
fn test_missing_file() {
    let dir = TempDir::new().unwrap();
    let err = read_segments(&dir.path().join("absent.txt")).unwrap_err();
    assert!(format!("{err:#}").contains("failed to open"));
}

#[test]
fn test_assemble_from_file_to_fasta() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("segments.txt");
    let output = dir.path().join("gene.fa");
    fs::write(&input, "cagc\ngatc\nggca\natcg\ncggc\ntcgg\ngcag\ngatc\n").unwrap();

    let segments = read_segments(&input).unwrap();
    let assembly = Assembler::default().assemble(&segments, 10).unwrap();
    write_fasta(File::create(&output).unwrap(), "gene", &assembly.sequence, 6).unwrap();

    assert_eq!(fs::read_to_string(&output).unwrap(), ">gene\ngatcgg\ncagc\n");
}
