use percent_encoding::{utf8_percent_encode, AsciiSet};

/// Controls, space and the characters with a meaning inside an URL.
pub const DEFAULT_ENCODE_SET: &AsciiSet = &percent_encoding::CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'?')
    .add(b'{')
    .add(b'}')
    .add(b'%');

/// Encode set for one path segment of an archive address.
pub const PATH_SEGMENT_ENCODE_SET: &AsciiSet = &DEFAULT_ENCODE_SET.add(b'/');

/// Encode set for a single address query value, which must not leak into the
/// surrounding query syntax.
pub const QUERY_VALUE_ENCODE_SET: &AsciiSet = &PATH_SEGMENT_ENCODE_SET
    .add(b'&')
    .add(b'=')
    .add(b'+');

/// percent encode a single path segment (keeps readable file names readable)
pub fn percent_encode_segment(comp: &str) -> String {
    utf8_percent_encode(comp, PATH_SEGMENT_ENCODE_SET).to_string()
}

/// percent encode a query parameter value
pub fn percent_encode_query_value(comp: &str) -> String {
    utf8_percent_encode(comp, QUERY_VALUE_ENCODE_SET).to_string()
}
