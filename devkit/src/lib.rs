/*!
# Greenbox DevKit - Bus simulé et fixtures pour les tests

Bibliothèque facilitant les tests des démons Greenbox avec:
- Bus MQTT simulé (enregistre les publications, route les messages entrants par filtre)
- Harness avec expectations sur les topics
- Fixtures de seuils, table d'effets et payloads conformes aux topics
*/

pub mod contract_helpers;
pub mod mqtt_stub;
pub mod test_utils;

pub use contract_helpers::{effects_table, thresholds, GreenboxMessageBuilder};
pub use mqtt_stub::{MockBus, MockMessage};
pub use test_utils::TestHarness;
