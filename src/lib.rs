// src/lib.rs

// On déclare tous nos modules principaux pour les rendre publics et
// utilisables par le binaire du bot.
pub mod config;
pub mod data_pipeline;
pub mod decoders;
pub mod dispatch;
pub mod execution;
pub mod ingestion;
pub mod ledger;
pub mod lookup;
pub mod monitoring;
pub mod rpc;
pub mod state;
