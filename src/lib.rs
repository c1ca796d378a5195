//! Sous - 对话助手的多工具编排引擎
//!
//! 模块划分：
//! - **cache**: 工具结果缓存（TTL + 陈旧数据窗口）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **context**: 会话上下文存储（惰性过期、周期清扫、实体提取）
//! - **core**: 错误类型、重试退避、运行级调度闸门
//! - **intent**: 意图分析与工具调用核对
//! - **memory**: 对话消息
//! - **observability**: tracing 初始化
//! - **progress**: 进度追踪与事件发布
//! - **tools**: 工具契约、注册表与执行器
//! - **workflow**: 依赖图、执行引擎、计划执行器

pub mod cache;
pub mod config;
pub mod context;
pub mod core;
pub mod intent;
pub mod memory;
pub mod observability;
pub mod progress;
pub mod tools;
pub mod workflow;
