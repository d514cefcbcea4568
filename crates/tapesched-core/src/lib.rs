//! tapesched-core
//!
//! Mount scheduling and job queues for a tape storage system.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, requests, mount policies, candidates, drives, jobs, errors）
//! - **ports**: 抽象化レイヤー（QueueStore, Catalogue, DriveRegistry, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（Scheduler, selection, drive sessions, status）
//! - **impls**: 実装（InMemoryQueueStore など開発・テスト用）
//! - **config**: TOML 設定

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
