//! Minimal bencode writers.
//!
//! Encoding is done with plain byte pushes rather than a serialization
//! framework; KRPC messages are small and the key order is fixed by hand
//! (bencode requires lexicographic dictionary keys).

pub fn write_bstr(out: &mut Vec<u8>, bytes: &[u8]) {
    let mut buf = itoa::Buffer::new();
    let len = buf.format(bytes.len());
    out.extend_from_slice(len.as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

pub fn write_str(out: &mut Vec<u8>, s: &str) {
    write_bstr(out, s.as_bytes());
}

pub fn write_int(out: &mut Vec<u8>, v: i64) {
    out.push(b'i');
    let mut buf = itoa::Buffer::new();
    let s = buf.format(v);
    out.extend_from_slice(s.as_bytes());
    out.push(b'e');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_and_int_forms() {
        let mut out = Vec::new();
        write_str(&mut out, "spam");
        write_int(&mut out, -42);
        assert_eq!(out, b"4:spami-42e");
    }

    #[test]
    fn empty_string() {
        let mut out = Vec::new();
        write_bstr(&mut out, b"");
        assert_eq!(out, b"0:");
    }
}
