mod codec;
mod types;

pub use codec::RespCodec;
pub use types::Reply;
