//! Policy-gated sandboxes for agent file and command operations.
//!
//! A [`SessionManager`] hands each caller identity its own
//! [`SandboxController`], an isolated environment driven through an
//! [`Engine`](engine::Engine). Every operation can be routed through a
//! [`GuardedSandbox`], which asks the [`PermissionEngine`] first.
//!
//! ```no_run
//! # async fn demo() -> boxwarden::Result<()> {
//! use boxwarden::Config;
//! use tokio_util::sync::CancellationToken;
//!
//! let manager = Config::load()?.session_manager()?;
//! let sandbox = manager.guarded("alice")?;
//! let cancel = CancellationToken::new();
//! sandbox.write("hello.py", "print('hi')\n", &cancel).await?;
//! let result = sandbox.execute("python hello.py", None, &cancel).await?;
//! println!("{}", result.output);
//! manager.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cmd;
pub mod config;
pub mod engine;
pub mod error;
pub mod guard;
pub mod logger;
pub mod pattern;
pub mod permissions;
pub mod sandbox;
pub mod session;
pub mod types;

pub use backend::{Backend, DEFAULT_READ_LIMIT, ExecBackend};
pub use config::Config;
pub use error::{Error, Result};
pub use guard::GuardedSandbox;
pub use permissions::{Action, Operation, PermissionEngine, PermissionRule, PermissionRuleset};
pub use sandbox::{SandboxController, SandboxOptions, SandboxState};
pub use session::{CleanupLoop, Session, SessionManager, SessionOptions};
pub use types::{
    EditOutcome, ExecuteResult, FileInfo, GrepMatch, PackageManager, RuntimeConfig, WriteOutcome,
};
