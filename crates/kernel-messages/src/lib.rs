//! Kernel message handling shared by notebook backends and the session engine.
//!
//! # Features
//!
//! - JSON decoding of backend messages into `jupyter_protocol::JupyterMessage`
//!   (base64 buffers, lenient `parent_header`)
//! - The canonical [`Output`] record and classification of iopub messages
//!   into output-area actions
//! - Gateway rewriting of cluster-internal links in HTML outputs

mod gateway;
mod message;
mod output;

pub use gateway::{
    rewrite_gateway_links, rewrite_output_links, GatewayAddress, DEFAULT_GATEWAY_PORT,
    DRIVER_LOG_PATH, YARN_UI_PATH,
};
pub use message::{
    message_from_value, message_to_json, parent_msg_id, parse_message, ConversionError,
    OutboundMessage, RawJupyterMessage,
};
pub use output::{classify_iopub, IopubAction, MimeBundle, Output};
