// 存储节点模块

pub mod client;
pub mod types;

pub use client::{HttpNodeClient, NodeClient};
pub use types::{
    AssetAttribute, AssetMetadata, NodeError, NodeErrorKind, NodeUploadRequest,
    NodeUploadResponse, UploadBody,
};

#[cfg(test)]
pub mod mock;
