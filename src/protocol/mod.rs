//! Wire protocol definitions for HandlerSocket
//!
//! Pure transforms between typed requests/responses and line frames; no I/O.

pub mod codec;
pub mod command;
pub mod response;
pub mod types;

pub use codec::{
    decode_request, decode_response, encode_error, encode_request, encode_response, next_frame,
    unescape, MAX_FRAME_SIZE,
};
pub use command::{Field, Request};
pub use response::{ResponseBody, WireResponse};
pub use types::{FindOperator, ModifyOperation, OperationKind, ResponseShape};
