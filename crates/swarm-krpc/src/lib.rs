pub mod bencode;
pub mod message;

pub use message::{
    compact_nodes,
    encode_error,
    encode_query,
    encode_reply,
    parse_compact_nodes,
    parse_compact_peers,
    parse_message,
    Message,
    MessageKind,
    NodeEntry,
    ParseError,
    Query,
    Response,
    CLIENT_VERSION,
    NODE_ID_LEN,
    TID_LEN,
};
