//! Greenbox kernel - briques communes du plan de contrôle des serres
//!
//! Chaque démon (actionneurs, capteurs, statistiques, contrôleur) lie cette crate :
//! - bandes de seuils et table des effets par serre
//! - modèles de messages et topics du bus MQTT
//! - client bus avec reconnexion/réabonnement et suivi de santé
//! - clients du catalogue (HTTP ou fichier local) et de la base de séries
//! - configuration par environnement et initialisation du tracing

pub mod bus;
pub mod catalog;
pub mod config;
pub mod effects;
pub mod health;
pub mod logging;
pub mod models;
pub mod state;
pub mod threshold;
pub mod topics;
pub mod tsdb;

pub use bus::{publish_json, BusClient, BusError, BusOptions, MessageHandler, Publisher};
pub use catalog::{Catalog, CatalogError};
pub use effects::{Effect, EffectRow, EffectsTable};
pub use models::{ActionMap, Zone, ZoneSnapshot};
pub use threshold::{Band, Threshold, ThresholdMap};
