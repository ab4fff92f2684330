//! Graceful replace and health-check placement across loop changes.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tcp_lb::load_balancer::Method;
use tcp_lb::{EventLoopGroup, ServerGroup};

mod common;

fn live_listener() -> (std::net::TcpListener, SocketAddr) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

fn group(name: &str, loops: usize) -> (Arc<EventLoopGroup>, Arc<ServerGroup>) {
    let elg = EventLoopGroup::with_threads(name, loops).unwrap();
    let group = ServerGroup::new(name, elg.clone(), common::fast_check(), Method::Wrr).unwrap();
    (elg, group)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replace_with_reachable_server_swaps_handle() {
    let (_l1, first) = live_listener();
    let (_l2, second) = live_listener();
    let (elg, group) = group("replace-ok", 2);

    let original = group.add("a", first, 7).unwrap();
    assert!(common::wait_until(|| original.is_healthy()).await);

    let replacement = group.add_with_replace("a", second, 7).unwrap();
    assert!(original.is_logic_delete());
    assert_eq!(original.to_string(), format!("*a -> connect to 127.0.0.1:{} weight 7 currently UP", first.port()));

    let g = group.clone();
    assert!(common::wait_until(|| g.server_handles().len() == 1).await);
    let handles = group.server_handles();
    assert!(Arc::ptr_eq(&handles[0], &replacement));
    assert_eq!(handles[0].server(), second);
    assert!(!original.is_valid());
    assert_eq!(group.next().unwrap().remote(), second);

    group.destroy();
    elg.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replace_with_unreachable_server_keeps_original() {
    let (_l1, first) = live_listener();
    let (elg, group) = group("replace-fail", 2);

    let original = group.add("a", first, 3).unwrap();
    assert!(common::wait_until(|| original.is_healthy()).await);

    group.add_with_replace("a", common::dead_addr(), 3).unwrap();
    let g = group.clone();
    assert!(common::wait_until(|| g.server_handles().len() == 1).await);

    let handles = group.server_handles();
    assert!(Arc::ptr_eq(&handles[0], &original));
    assert!(!original.is_logic_delete());
    assert!(original.is_valid());
    assert_eq!(group.next().unwrap().remote(), first);

    group.destroy();
    elg.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replace_ip_keeps_port_and_weight() {
    let (_l1, first) = live_listener();
    let (elg, group) = group("replace-ip", 1);

    let original = group.add("a", first, 4).unwrap();
    let localhost: IpAddr = "127.0.0.1".parse().unwrap();
    let replacement = group.replace_ip("a", localhost).unwrap();
    assert_eq!(replacement.server(), SocketAddr::new(localhost, first.port()));
    assert_eq!(replacement.weight(), 4);
    assert!(original.is_logic_delete());

    let g = group.clone();
    assert!(common::wait_until(|| g.server_handles().len() == 1).await);
    assert!(Arc::ptr_eq(&group.server_handles()[0], &replacement));

    group.destroy();
    elg.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health_check_moves_when_its_loop_closes() {
    let (_l1, addr) = live_listener();
    let (elg, group) = group("moves", 2);

    let handle = group.add("a", addr, 1).unwrap();
    let first_loop = handle.check_loop().unwrap();
    assert!(common::wait_until(|| handle.is_healthy()).await);

    elg.remove(&first_loop).unwrap();
    let second_loop = handle.check_loop().unwrap();
    assert_ne!(second_loop, first_loop);
    assert!(handle.is_valid());
    assert!(group.next().is_some());

    // with no loop left the check waits for a new one
    elg.remove(&second_loop).unwrap();
    assert!(handle.check_loop().is_none());
    elg.add("moves-late").unwrap();
    assert_eq!(handle.check_loop().as_deref(), Some("moves-late"));

    group.destroy();
    elg.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wlc_prefers_fewest_connections() {
    let (_l1, a) = live_listener();
    let (_l2, b) = live_listener();
    let (elg, group) = group("wlc", 1);
    group.set_method(Method::Wlc);

    let ha = group.add("a", a, 1).unwrap();
    let hb = group.add("b", b, 1).unwrap();
    assert!(common::wait_until(|| ha.is_healthy() && hb.is_healthy()).await);

    let _busy = ha.track_connection();
    assert_eq!(group.next().unwrap().remote(), b);
    let _busy_b = hb.track_connection();
    let _busy_b2 = hb.track_connection();
    assert_eq!(group.next().unwrap().remote(), a);

    group.destroy();
    elg.close();
}
