//! Start/stop/destroy behavior of a load balancer against its acceptor group.

use std::net::SocketAddr;
use std::sync::Arc;

use tcp_lb::load_balancer::Method;
use tcp_lb::{AllowAll, EventLoopGroup, LbError, ServerGroup, TcpLb};

mod common;

fn setup(name: &str, acceptor_threads: usize) -> (Arc<EventLoopGroup>, Arc<EventLoopGroup>, Arc<ServerGroup>, Arc<TcpLb>) {
    let acceptors = EventLoopGroup::with_threads(format!("{}-acceptor", name), acceptor_threads).unwrap();
    let workers = EventLoopGroup::with_threads(format!("{}-worker", name), 1).unwrap();
    let group = ServerGroup::new(name, workers.clone(), common::fast_check(), Method::Wrr).unwrap();
    let bind = SocketAddr::from(([127, 0, 0, 1], common::free_port()));
    let lb = TcpLb::new(name, acceptors.clone(), workers.clone(), bind, group.clone(), Arc::new(AllowAll)).unwrap();
    (acceptors, workers, group, lb)
}

#[test]
fn test_repeated_start_binds_nothing_new() {
    let (acceptors, workers, _group, lb) = setup("restart", 2);
    lb.start().unwrap();
    assert_eq!(lb.listener_count(), 2);
    let bound = lb.bound_addresses();
    assert!(bound.iter().all(|a| *a == lb.bind_address()));

    lb.start().unwrap();
    assert_eq!(lb.listener_count(), 2);

    acceptors.close();
    workers.close();
}

#[test]
fn test_added_acceptor_loop_gets_one_listener() {
    let (acceptors, workers, _group, lb) = setup("addloop", 1);
    lb.start().unwrap();
    assert_eq!(lb.listener_count(), 1);

    acceptors.add("addloop-acceptor-extra").unwrap();
    assert_eq!(lb.listener_count(), 2);

    acceptors.remove("addloop-acceptor-extra").unwrap();
    assert_eq!(lb.listener_count(), 1);

    acceptors.close();
    workers.close();
}

#[test]
fn test_loop_added_while_stopped_is_ignored() {
    let (acceptors, workers, _group, lb) = setup("stopped", 1);
    acceptors.add("stopped-acceptor-extra").unwrap();
    assert_eq!(lb.listener_count(), 0);

    lb.start().unwrap();
    assert_eq!(lb.listener_count(), 2);
    lb.stop();
    assert_eq!(lb.listener_count(), 0);
    assert!(lb.is_stopped());

    acceptors.add("stopped-acceptor-late").unwrap();
    assert_eq!(lb.listener_count(), 0);

    // stop keeps the load balancer restartable
    lb.start().unwrap();
    assert_eq!(lb.listener_count(), 3);

    acceptors.close();
    workers.close();
}

#[test]
fn test_start_after_destroy_fails() {
    let (acceptors, workers, _group, lb) = setup("destroyed", 1);
    lb.start().unwrap();
    lb.destroy();
    assert_eq!(lb.listener_count(), 0);
    assert!(matches!(lb.start(), Err(LbError::Closed(_))));

    // destroyed load balancers no longer react to the group
    acceptors.add("destroyed-acceptor-extra").unwrap();
    assert_eq!(lb.listener_count(), 0);

    acceptors.close();
    workers.close();
}

#[test]
fn test_acceptor_group_close_destroys_lb() {
    let (acceptors, workers, _group, lb) = setup("groupclose", 1);
    lb.start().unwrap();
    acceptors.close();
    assert!(lb.is_destroyed());
    assert_eq!(lb.listener_count(), 0);
    workers.close();
}

#[test]
fn test_bind_failure_propagates_and_lb_stays_retryable() {
    let (acceptors, workers, _group, lb) = setup("bindfail", 1);
    let blocker = std::net::TcpListener::bind(lb.bind_address()).unwrap();
    assert!(matches!(lb.start(), Err(LbError::Io(_))));
    assert_eq!(lb.listener_count(), 0);

    drop(blocker);
    lb.start().unwrap();
    assert_eq!(lb.listener_count(), 1);

    acceptors.close();
    workers.close();
}
