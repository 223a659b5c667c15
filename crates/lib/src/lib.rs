//! fluxnix-lib: Core types and logic for fluxnix
//!
//! This crate turns a new source revision into a published build artifact:
//! - `source`: tracked objects, artifacts and the revision-change predicate
//! - `nix`: the `nix build` orchestrator and its structured log protocol
//! - `archive`: deterministic tar.gz packaging of build outputs
//! - `fetch` / `publish`: the artifact download and object-store upload seams
//! - `reconcile`: the fetch → build → package → publish pipeline

pub mod archive;
pub mod cancel;
pub mod config;
pub mod consts;
pub mod fetch;
pub mod nix;
pub mod publish;
pub mod reconcile;
pub mod source;

#[cfg(test)]
pub mod testutil;
