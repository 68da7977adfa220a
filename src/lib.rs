#![cfg_attr(docsrs, feature(doc_cfg))]
/*!

# signon-core

This crate provides the core of a single sign-on credential and secret
storage daemon. It holds per-user authentication identities (account
credentials plus per-method opaque state), mediates access to them
across multiple client applications on the same machine, and runs
authentication plugins (OAuth, SASL, password, etc.) in sandboxed
subprocesses on behalf of clients.

A top-level introduction to the library's usage, as well as a small
code sample, may be found on [crates.io](https://crates.io/crates/signon-core).

## Design

Three tightly coupled subsystems carry the real design weight:

1. **The identity/credential storage engine**
   ([store::credentials_db::CredentialsDatabase]) — a two-database
   model (a "metadata" store for non-secret descriptive data and ACLs,
   and a "secret" store for passwords and per-method opaque blobs),
   kept consistent under transactional updates, with an in-memory
   secret cache ([store::cache::SecretCache]) that can batch writes.
2. **The plugin host and proxy layer** ([plugin]) — out-of-process
   plugin workers spawned per authentication method, driven by a
   request FIFO per plugin ([plugin::proxy::PluginProxy]), with a
   state machine per authentication session, idle-eviction,
   cancellation, and crash recovery.
3. **The access-control and session model**
   ([access_control::AccessControlManager], [session::AuthSession],
   [identity::Identity]) — peer identification from an IPC endpoint,
   ACL checks on every operation, auto-disposing session objects, and
   the identity lifecycle (new → stored → validated → signed-out →
   removed).

[service::AuthService] is the daemon-core singleton an embedding IPC
front end constructs once at startup: it owns the shared
`CredentialsDatabase`, the plugin-proxy registry, and the configured
[access_control::AccessControlManager], and hands out per-client
[identity::Identity] façades over them.

## Out of scope

The IPC transport itself (whether a message bus or per-connection
socket), the specific wire serialization of client requests, the
UI-prompting helper used for interactive credentials, configuration
file parsing, and the concrete content of individual plugin protocols
are all left to the embedding application. This crate does not itself
implement any authentication protocol, does not cache decrypted
secrets across process restarts, and does not enforce network-level
policy.

## Thread Safety

[service::AuthService] and [store::credentials_db::CredentialsDatabase]
are `Send + Sync`; interior mutability is via `Mutex`, matching the
single-threaded cooperative event loop this crate is designed to run
under (concurrent access from multiple threads is safe but serializes
on that lock, same as the daemon's own event loop would).
 */

pub mod access_control;
pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod identity;
pub mod identity_info;
pub mod method_cache;
pub mod plugin;
pub mod service;
pub mod session;
pub mod store;

pub use context::SecurityContext;
pub use error::{Error, Result};
pub use identity::Identity;
pub use identity_info::IdentityInfo;
pub use service::AuthService;
pub use session::AuthSession;

#[cfg(doctest)]
doc_comment::doctest!("../README.md", readme);
