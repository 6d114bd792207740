//! RPC transport: wire codec, server, client, keep-alive and shutdown control.

pub mod client;
pub mod codec;
pub mod config;
pub mod server;
pub mod shutdown;

use tokio::time::Instant;

pub use client::{CallOptions, DialError, RpcClient, Target};
pub use codec::{CodecError, FrameCodec};
pub use config::{BalancerPolicy, ClientConfig, KeepAliveConfig, ServerConfig};
pub use server::{RpcServer, RunningServer, ServerError};
pub use shutdown::{ServingState, ShutdownController};

/// Sleeps until `deadline`, or forever when there is none. Used for
/// optional timers inside `select!` loops.
pub(crate) async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod integration_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use skiff_core::{Code, ServiceInfo};

    use super::*;
    use crate::discovery::{
        DiscoveryProvider, RegistryConfig, ResolverBuilder, ResolverConfig, ServiceRegistry,
    };
    use crate::store::{CoordinationStore, MemoryStore};

    const SAY: &str = "/echo.Echo/Say";
    const SLOW: &str = "/echo.Echo/Slow";

    fn server_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            ..ServerConfig::default()
        }
    }

    fn client_config() -> ClientConfig {
        ClientConfig {
            dial_timeout: Duration::from_secs(1),
            call_timeout: Some(Duration::from_secs(5)),
            ..ClientConfig::default()
        }
    }

    /// Echo server tagging replies with `tag`; `Slow` sleeps for the
    /// requested number of milliseconds first.
    async fn echo_server(tag: &'static str) -> RunningServer {
        let mut server = RpcServer::new(server_config()).unwrap();
        server
            .unary(SAY, move |msg: String| async move { Ok(format!("{tag}:{msg}")) })
            .unary(SLOW, |ms: u64| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(ms)
            })
            .unary("/echo.Echo/Panic", |_: ()| async move {
                if true {
                    panic!("handler bug");
                }
                Ok(())
            });
        server.start().await.unwrap()
    }

    async fn direct(server: &RunningServer) -> RpcClient {
        RpcClient::dial(&server.local_addr().to_string(), client_config(), None)
            .await
            .unwrap()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(3), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn calls_reach_instances_found_through_discovery() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let registry = ServiceRegistry::new(Arc::clone(&store), RegistryConfig::default());
        let provider: Arc<dyn DiscoveryProvider> = Arc::new(ResolverBuilder::new(
            Arc::clone(&store),
            ResolverConfig::default(),
        ));

        let a = echo_server("a").await;
        registry
            .register(&ServiceInfo::new("echo", "rpc", a.local_addr().to_string()))
            .await
            .unwrap();

        let client = RpcClient::dial("discovery:///echo", client_config(), Some(provider))
            .await
            .unwrap();
        let reply: String = client
            .call(SAY, &"hi".to_string(), CallOptions::default())
            .await
            .unwrap();
        assert_eq!(reply, "a:hi");

        let b = echo_server("b").await;
        registry
            .register(&ServiceInfo::new("echo", "rpc", b.local_addr().to_string()))
            .await
            .unwrap();
        eventually(|| client.addresses().len() == 2).await;

        let mut seen = std::collections::HashSet::new();
        for _ in 0..10 {
            let reply: String = client
                .call(SAY, &"x".to_string(), CallOptions::default())
                .await
                .unwrap();
            seen.insert(reply);
        }
        assert_eq!(seen.len(), 2, "both instances should serve calls: {seen:?}");

        registry.close().await;
        client.close().await;
        a.stop(Duration::from_secs(1)).await.unwrap();
        b.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn graceful_stop_completes_in_flight_calls() {
        let server = echo_server("s").await;
        let client = Arc::new(direct(&server).await);

        let calls: Vec<_> = (0..5)
            .map(|_| {
                let client = Arc::clone(&client);
                tokio::spawn(async move {
                    client
                        .call::<u64, u64>(SLOW, &200, CallOptions::default())
                        .await
                })
            })
            .collect();
        eventually(|| server.in_flight() == 5).await;

        server.stop(Duration::from_secs(3)).await.unwrap();
        for call in calls {
            assert_eq!(call.await.unwrap(), Ok(200));
        }
    }

    #[tokio::test]
    async fn stop_past_deadline_reports_and_forces() {
        let server = echo_server("s").await;
        let client = Arc::new(direct(&server).await);

        let stuck = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                let options = CallOptions::default().with_timeout(Duration::from_secs(20));
                client.call::<u64, u64>(SLOW, &10_000, options).await
            })
        };
        eventually(|| server.in_flight() == 1).await;

        let started = tokio::time::Instant::now();
        let err = server.stop(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, ServerError::DeadlineExceeded { in_flight: 1, .. }));
        assert!(started.elapsed() < Duration::from_secs(2));

        let status = stuck.await.unwrap().unwrap_err();
        assert_eq!(status.code, Code::Unavailable);
    }

    #[tokio::test]
    async fn draining_server_refuses_new_connections() {
        let server = echo_server("s").await;
        let addr = server.local_addr().to_string();
        server.stop(Duration::from_secs(1)).await.unwrap();

        let err = RpcClient::dial(&addr, client_config(), None).await.err().unwrap();
        assert!(matches!(err, DialError::Connect { .. }));
    }

    #[tokio::test]
    async fn call_deadline_is_enforced() {
        let server = echo_server("s").await;
        let client = direct(&server).await;

        let status = client
            .call::<u64, u64>(
                SLOW,
                &2_000,
                CallOptions::default().with_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert_eq!(status.code, Code::DeadlineExceeded);

        client.close().await;
        server.stop(Duration::from_secs(3)).await.unwrap();
    }

    #[tokio::test]
    async fn unsendable_response_fails_only_its_call() {
        const FILL: &str = "/blob.Blob/Fill";
        let mut server = RpcServer::new(ServerConfig {
            max_message_size: 1024,
            ..server_config()
        })
        .unwrap();
        server
            .unary(FILL, |len: usize| async move { Ok("x".repeat(len)) })
            .unary(SLOW, |ms: u64| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(ms)
            });
        let server = server.start().await.unwrap();
        let client = direct(&server).await;

        let slow = client.call::<u64, u64>(SLOW, &300, CallOptions::default());
        let fill = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            // The payload fits the limit, the response frame around it does not.
            client.call::<usize, String>(FILL, &1015, CallOptions::default()).await
        };
        let (slow, fill) = tokio::join!(slow, fill);

        assert_eq!(fill.unwrap_err().code, Code::ResourceExhausted);
        assert_eq!(slow.unwrap(), 300);
        let small: String = client.call(FILL, &3usize, CallOptions::default()).await.unwrap();
        assert_eq!(small, "xxx");
        assert_eq!(client.connections(), 1);

        client.close().await;
        server.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_method_is_unimplemented() {
        let server = echo_server("s").await;
        let client = direct(&server).await;
        let status = client
            .invoke("/echo.Echo/Missing", bytes::Bytes::new(), CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(status.code, Code::Unimplemented);
        client.close().await;
        server.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn handler_panic_becomes_internal_error() {
        let server = echo_server("s").await;
        let client = direct(&server).await;
        let status = client
            .call::<(), ()>("/echo.Echo/Panic", &(), CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(status.code, Code::Internal);

        let reply: String = client
            .call(SAY, &"still up".to_string(), CallOptions::default())
            .await
            .unwrap();
        assert_eq!(reply, "s:still up");
        client.close().await;
        server.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn trace_id_travels_with_the_call() {
        let server = echo_server("s").await;
        let client = direct(&server).await;
        let resp = client
            .invoke(
                SAY,
                crate::service::encode_message(&"t".to_string()).unwrap(),
                CallOptions::default().with_metadata(skiff_core::messages::TRACE_ID_KEY, "abc"),
            )
            .await
            .unwrap();
        assert_eq!(
            resp.metadata.get(skiff_core::messages::TRACE_ID_KEY).map(String::as_str),
            Some("abc")
        );
        client.close().await;
        server.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn blocking_dial_surfaces_connect_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = RpcClient::dial(&addr, client_config(), None).await.err().unwrap();
        assert!(matches!(err, DialError::Connect { .. }));
    }

    #[tokio::test]
    async fn blocking_dial_times_out_without_instances() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let provider: Arc<dyn DiscoveryProvider> =
            Arc::new(ResolverBuilder::new(store, ResolverConfig::default()));
        let err = RpcClient::dial(
            "discovery:///nobody",
            ClientConfig {
                dial_timeout: Duration::from_millis(100),
                ..client_config()
            },
            Some(provider),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, DialError::Timeout(_)));
    }

    #[tokio::test]
    async fn server_max_age_sends_go_away_and_client_redials() {
        let mut config = server_config();
        config.keep_alive.max_connection_age = Some(Duration::from_millis(100));
        config.keep_alive.max_connection_age_grace = Duration::from_millis(100);
        let mut server = RpcServer::new(config).unwrap();
        server.unary(SAY, |msg: String| async move { Ok(msg) });
        let server = server.start().await.unwrap();
        let client = direct(&server).await;

        let first: String = client.call(SAY, &"1".to_string(), CallOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let second: String = client.call(SAY, &"2".to_string(), CallOptions::default()).await.unwrap();
        assert_eq!((first.as_str(), second.as_str()), ("1", "2"));

        client.close().await;
        server.stop(Duration::from_secs(1)).await.unwrap();
    }
}
