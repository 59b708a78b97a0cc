//! stagehand-cli - サンプルワークフローとデモ用のクラウド API
//!
//! - `remote`: ワークフローが呼ぶ外部 API の trait と、台本どおりに応答する `ScriptedCloud`
//! - `workflows`: タグ同期、セキュリティグループキャッシュ同期、スナップショットポリシー適用

pub mod remote;
pub mod workflows;
