//! notebook-session - Kernel session lifecycle and cell execution for notebooks.
//!
//! A [`NotebookModel`] owns the cells of one document and a [`ClientSession`]
//! per backend. Cells run through the active session's kernel; replies and
//! iopub messages reach the cell through an [`ExecutionFuture`] and land in
//! its output area as canonical [`Output`] records.
//!
//! Backends plug in through the traits in [`kernel`]: a session manager
//! (required), plus optional server and content managers.

pub mod cell;
pub mod client_session;
pub mod contents;
pub mod contexts;
pub mod deferred;
pub mod error;
pub mod events;
pub mod future;
pub mod kernel;
pub mod notebook_model;
pub mod settings;

pub use cell::{CellExecutionState, CellModel, OutputsChanged};
pub use client_session::{
    ClientSession, ClientSessionOptions, KernelChangedArgs, KernelChangingHook, KernelPreference,
};
pub use contents::{
    parse_notebook, serialize_notebook, CellContents, CellMetadata, CellType, FileContentManager,
    LanguageInfo, NotebookContents, NotebookMetadata,
};
pub use contexts::{ClusterEndpoint, ConnectionProfile, NotebookContexts};
pub use deferred::{Deferred, DeferredWaiter};
pub use error::{ExecutionError, NotebookError, SessionError};
pub use events::{Emitter, Subscription};
pub use future::{ExecutionFuture, FutureRouter, FutureSender, MessageHandler};
pub use kernel::{
    ConnectionService, ContentManager, Kernel, KernelInfo, KernelSpec, KernelSpecs, KernelStatus,
    NotebookManager, ServerManager, Session, SessionManager, SessionOptions,
};
pub use kernel_messages::{GatewayAddress, IopubAction, Output};
pub use notebook_model::{
    ConnectionRequester, NotebookChangeType, NotebookContentChange, NotebookEditOperation,
    NotebookModel, NotebookOptions, Notification, Severity,
};
pub use settings::{EngineSettings, GatewaySettings, StandardKernel};
