//! # vault-sync
//!
//! Keeps a remote search index synchronized with a tree of markdown notes
//! and serves semantic queries against it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────────┐   ┌──────────────┐
//! │ Vault tree  │──▶│ Sync engine          │──▶│ Search index │
//! │ + events    │   │ read→chunk→embed→add │   │ (Meilisearch)│
//! └─────────────┘   └──────────┬───────────┘   └──────┬───────┘
//!                              │                      │
//!                     ┌────────▼────────┐      ┌──────▼──────┐
//!                     │ Embeddings svc  │      │ vsync search│
//!                     └─────────────────┘      └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! vsync health                  # wait-free health probe
//! vsync sync --dry-run          # show what would change
//! vsync sync                    # reconcile the index with the vault
//! vsync search "reading list"   # semantic search
//! vsync watch                   # follow file events until Ctrl-C
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Files, documents, chunks, typed errors |
//! | [`vault`] | Vault scanning and document reading |
//! | [`chunk`] | Recursive text splitting with line provenance |
//! | [`embedding`] | Embedder trait and HTTP embeddings client |
//! | [`index`] | Search index trait, Meilisearch client, in-memory index |
//! | [`retry`] | Poll-until primitives and scheduled tasks |
//! | [`debounce`] | Per-key trailing debouncer |
//! | [`status`] | Sync status indicator |
//! | [`sync`] | Reconciliation engine |
//! | [`listener`] | File-event routing |
//! | [`watcher`] | Vault file-system watcher feeding the listener |
//! | [`search`] | Semantic search and context formatting |
//! | [`session`] | Per-session chat history |

pub mod chunk;
pub mod config;
pub mod debounce;
pub mod embedding;
pub mod index;
pub mod listener;
pub mod models;
pub mod retry;
pub mod search;
pub mod session;
pub mod status;
pub mod sync;
pub mod vault;
pub mod watcher;
