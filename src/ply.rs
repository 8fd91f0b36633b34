//! Incremental parser for one strict dialect of PLY: an ASCII header
//! declaring a single `vertex` element with only `float` properties,
//! followed immediately by its binary little-endian payload.
//!
//! [`parse_ply_chunk`] is restartable across arbitrary chunk boundaries —
//! inside the header (a partial line may span two calls) and inside the
//! payload (a partial vertex may span two calls).

const MAX_HEADER_LINES: u32 = 1000;

/// Reached when the byte stream ends without ever closing the header. Set
/// by the scene database, not the parser itself, since `parse_ply_chunk`
/// has no notion of end-of-stream — only the caller knows when no more
/// chunks are coming.
pub const END_HEADER_NOT_FOUND: &str = "Did not find end_header token";

#[derive(Default)]
struct HeaderState {
    pending_line: Vec<u8>,
    lines_seen: u32,
    saw_magic: bool,
}

enum LineOutcome {
    Continue,
    EndHeader,
}

/// Parser state for one in-flight PLY stream.
#[derive(Default)]
pub struct PlyFileData {
    error_str: Option<String>,
    has_header: bool,
    vertex_count: u64,
    stride_size: u32,
    payload_size: usize,
    payload_read_size: usize,
    payload: Option<Vec<u8>>,
    header: HeaderState,
}

impl PlyFileData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error_str(&self) -> Option<&str> {
        self.error_str.as_deref()
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error_str = Some(message.into());
    }

    pub fn has_header(&self) -> bool {
        self.has_header
    }

    pub fn vertex_count(&self) -> u64 {
        self.vertex_count
    }

    pub fn stride_size(&self) -> u32 {
        self.stride_size
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn payload_read_size(&self) -> usize {
        self.payload_read_size
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn is_payload_complete(&self) -> bool {
        self.has_header && self.payload_read_size == self.payload_size
    }
}

/// Feed the next chunk of bytes into `state`. Returns how many bytes of
/// `buffer` were consumed this call (header bytes plus any payload bytes
/// copied). Once `state` has recorded an error, every subsequent call is a
/// no-op returning 0.
pub fn parse_ply_chunk(state: &mut PlyFileData, buffer: &[u8]) -> usize {
    if state.error_str.is_some() {
        return 0;
    }

    let mut consumed = 0;
    if !state.has_header {
        consumed += parse_header_portion(state, buffer);
        if state.error_str.is_some() || !state.has_header {
            return consumed;
        }
    }

    consumed + consume_payload(state, &buffer[consumed..])
}

fn parse_header_portion(state: &mut PlyFileData, buffer: &[u8]) -> usize {
    let mut idx = 0;
    while idx < buffer.len() {
        let byte = buffer[idx];
        idx += 1;
        if byte != b'\n' {
            state.header.pending_line.push(byte);
            continue;
        }

        let line = std::mem::take(&mut state.header.pending_line);
        match process_header_line(state, &line) {
            Ok(LineOutcome::EndHeader) => {
                state.has_header = true;
                return idx;
            }
            Ok(LineOutcome::Continue) => {}
            Err(message) => {
                state.error_str = Some(message);
                return idx;
            }
        }
    }
    idx
}

fn process_header_line(state: &mut PlyFileData, line: &[u8]) -> Result<LineOutcome, String> {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim();

    state.header.lines_seen += 1;
    if state.header.lines_seen > MAX_HEADER_LINES {
        return Err("Exceeded header number of lines".to_string());
    }

    if trimmed.is_empty() {
        return Ok(LineOutcome::Continue);
    }

    if !state.header.saw_magic {
        if trimmed != "ply" {
            return Err("Expected 'ply' as the first header line".to_string());
        }
        state.header.saw_magic = true;
        return Ok(LineOutcome::Continue);
    }

    let mut words = trimmed.split_whitespace();
    match words.next() {
        Some("format") => {
            let rest: Vec<&str> = words.collect();
            if rest != ["binary_little_endian", "1.0"] {
                return Err("Only supports binary_little_endian 1.0 format".to_string());
            }
        }
        Some("element") => {
            let name = words.next();
            let count = words.next();
            if name != Some("vertex") {
                return Err("Only supports a vertex element".to_string());
            }
            let count = count.ok_or_else(|| "Missing vertex count".to_string())?;
            state.vertex_count = count
                .parse()
                .map_err(|_| format!("Could not parse vertex count '{count}'"))?;
        }
        Some("property") => {
            let kind = words.next();
            if kind != Some("float") {
                return Err("Only supports float property".to_string());
            }
            // Property name is optional and otherwise ignored.
            state.stride_size += 4;
        }
        Some("end_header") => return Ok(LineOutcome::EndHeader),
        // Comments and any other directive are ignored.
        _ => {}
    }
    Ok(LineOutcome::Continue)
}

fn consume_payload(state: &mut PlyFileData, buffer: &[u8]) -> usize {
    if state.payload.is_none() {
        let payload_size = state.vertex_count as usize * state.stride_size as usize;
        state.payload_size = payload_size;
        state.payload = Some(vec![0u8; payload_size]);
    }

    let remaining = state.payload_size - state.payload_read_size;
    let n = buffer.len().min(remaining);
    if n > 0 {
        let payload = state.payload.as_mut().expect("allocated above");
        let start = state.payload_read_size;
        payload[start..start + n].copy_from_slice(&buffer[..n]);
        state.payload_read_size += n;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube_bytes() -> Vec<u8> {
        let header = b"ply\nformat binary_little_endian 1.0\nelement vertex 2\nproperty float x\nproperty float y\nproperty float z\nend_header\n";
        let mut bytes = header.to_vec();
        let floats: [f32; 6] = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        for f in floats {
            bytes.extend_from_slice(&f.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn parses_header_and_payload_in_one_call() {
        let bytes = cube_bytes();
        let mut state = PlyFileData::new();
        let consumed = parse_ply_chunk(&mut state, &bytes);
        assert_eq!(consumed, bytes.len());
        assert_eq!(state.vertex_count(), 2);
        assert_eq!(state.stride_size(), 12);
        assert_eq!(state.payload_size(), 24);
        assert!(state.is_payload_complete());
        assert_eq!(state.payload().unwrap(), &bytes[bytes.len() - 24..]);
    }

    #[test]
    fn chunk_boundary_independence() {
        let bytes = cube_bytes();
        for split_points in [&[1, 7, 13][..], &[50, 1, 1][..], &[bytes.len()][..]] {
            let mut state = PlyFileData::new();
            let mut offset = 0;
            for &len in split_points {
                let end = (offset + len).min(bytes.len());
                parse_ply_chunk(&mut state, &bytes[offset..end]);
                offset = end;
            }
            if offset < bytes.len() {
                parse_ply_chunk(&mut state, &bytes[offset..]);
            }
            assert!(state.is_payload_complete(), "failed for splits {split_points:?}");
            assert_eq!(state.payload().unwrap(), &bytes[bytes.len() - 24..]);
        }
    }

    #[test]
    fn unsupported_property_errors() {
        let header = b"ply\nformat binary_little_endian 1.0\nelement vertex 1\nproperty uchar red\nend_header\n";
        let mut state = PlyFileData::new();
        parse_ply_chunk(&mut state, header);
        assert!(state.error_str().unwrap().contains("Only supports float property"));
    }

    #[test]
    fn property_without_name_still_counts_stride() {
        let header = b"ply\nformat binary_little_endian 1.0\nelement vertex 1\nproperty float\nend_header\n";
        let mut state = PlyFileData::new();
        parse_ply_chunk(&mut state, header);
        assert_eq!(state.stride_size(), 4);
        assert!(state.error_str().is_none());
    }

    #[test]
    fn truncated_payload_is_detected_by_caller() {
        let bytes = cube_bytes();
        let truncated = &bytes[..bytes.len() - 4];
        let mut state = PlyFileData::new();
        parse_ply_chunk(&mut state, truncated);
        assert!(!state.is_payload_complete());
        assert_eq!(state.payload_read_size(), state.payload_size() - 4);
    }

    #[test]
    fn header_line_cap_is_enforced() {
        let mut header = String::from("ply\n");
        for _ in 0..1100 {
            header.push_str("comment filler\n");
        }
        let mut state = PlyFileData::new();
        parse_ply_chunk(&mut state, header.as_bytes());
        assert_eq!(state.error_str(), Some("Exceeded header number of lines"));
    }

    #[test]
    fn zero_vertex_file_completes_with_empty_payload() {
        let header = b"ply\nformat binary_little_endian 1.0\nelement vertex 0\nproperty float x\nend_header\n";
        let mut state = PlyFileData::new();
        parse_ply_chunk(&mut state, header);
        assert!(state.is_payload_complete());
        assert_eq!(state.payload_size(), 0);
        assert_eq!(state.payload().unwrap().len(), 0);
    }
}
