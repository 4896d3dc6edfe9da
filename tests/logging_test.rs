//! 日志初始化测试
//!
//! 全局订阅器每个进程只能安装一次，所以这里只有一个用例。

use flare_discovery::{LogConfig, LogFormat, LogOutput, init_logging};

#[test]
fn test_init_logging_writes_json_file_once() {
    let path = std::env::temp_dir().join(format!("flare-discovery-{}.log", uuid::Uuid::new_v4()));
    let config = LogConfig {
        level: "info".to_string(),
        format: LogFormat::Json,
        output: LogOutput::File { path: path.clone() },
    };

    init_logging(&config).expect("first init should succeed");
    assert!(init_logging(&config).is_err(), "second init must fail");

    tracing::error!(node_id = "a1", "logging smoke test");

    let content = std::fs::read_to_string(&path).unwrap();
    let _ = std::fs::remove_file(&path);
    assert!(content.contains("logging smoke test"), "{}", content);
    assert!(content.contains("\"node_id\":\"a1\""), "{}", content);
}
