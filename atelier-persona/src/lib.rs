//! Persona generation, evolution, and asset caching for the Atelier installation.
//!
//! The flow: uploads land in the [`AssetCache`]; once a session has both
//! its photo and its doodle, the [`PersonaBuilder`] runs exactly one
//! image-conditioned generation and persists the result through the
//! [`PersonaStore`]. Later motion interactions feed the [`PersonaEvolver`],
//! which merges model patches into the stored record without ever
//! discarding fields it was not told to replace.

#![warn(clippy::all)]

pub mod assets;
pub mod builder;
pub mod evolver;
pub mod llm;
pub mod store;
pub mod types;

pub use assets::{AssetCache, AssetKind, PendingAssets};
pub use builder::{BuildOutcome, PersonaBuilder};
pub use evolver::PersonaEvolver;
pub use llm::{parse_json_object, CompletionRequest, ImagePart, LanguageModel, OpenAiChat};
pub use store::PersonaStore;
pub use types::{Persona, PersonaCore, PersonaPatch, PersonaPlans, PersonaRecord};
