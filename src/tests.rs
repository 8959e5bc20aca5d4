// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::*;
use futures::future::join_all;
use im::OrdSet as ArcOrdSet;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing_subscriber::EnvFilter;

type Engine = DiscreteEngine<String>;
type Proc = QProc<Engine>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("consilium=debug")),
        )
        .with_test_writer()
        .try_init();
}

fn set(xs: &[&str]) -> ArcOrdSet<String> {
    xs.iter().map(|s| s.to_string()).collect()
}

fn pids(xs: &[&str]) -> Vec<Pid> {
    xs.iter().map(|s| Pid::from(*s)).collect()
}

fn group(members: &[&str], leader: &str) -> Vec<Proc> {
    let cfg = Cfg::new(pids(members), leader).expect("valid cfg");
    group_with(cfg)
}

fn group_with(cfg: Cfg) -> Vec<Proc> {
    let mut routers = local::mesh::<QMessage, QParamsOf<Engine>>(cfg.members()).expect("mesh");
    cfg.members()
        .iter()
        .map(|pid| {
            let router = routers.remove(pid).expect("router per member");
            QProc::new(pid.clone(), router, cfg.clone(), Engine::new()).expect("participant")
        })
        .collect()
}

// Start everyone (only the leader actually drives) and collect every
// participant's decision, failing rather than hanging if agreement stalls.
async fn decide(procs: &[Proc]) -> Vec<Decision<ArcOrdSet<String>>> {
    let drivers: Vec<_> = procs
        .iter()
        .cloned()
        .map(|p| tokio::spawn(async move { p.start().await }))
        .collect();
    let decisions = timeout(
        Duration::from_secs(10),
        join_all(procs.iter().map(|p| p.await_final_choices())),
    )
    .await
    .expect("agreement stalled");
    for driver in drivers {
        driver.await.expect("driver panicked").expect("driver failed");
    }
    decisions
        .into_iter()
        .map(|d| d.expect("decision"))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commit_when_everyone_agrees() {
    init_tracing();
    let procs = group(&["a", "b", "c"], "a");
    for p in procs.iter() {
        p.inject_input(Tiers::from(set(&["7pm"])));
    }
    let decisions = decide(&procs).await;
    for d in decisions.iter() {
        assert_eq!(d.choices, set(&["7pm"]));
        assert_eq!(d.outcome, Outcome::Agreed { round: 1 });
        assert!(d.is_agreement());
    }
    assert_eq!(procs[0].round(), 1);
    assert_eq!(procs[1].round(), 0);
    for p in procs.iter() {
        assert_eq!(p.stage(), Stage::Committed);
        let opinion = p.latest_opinion().await.expect("reported choices");
        assert_eq!(opinion.choices, set(&["7pm"]));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn round_cap_commits_empty_set() {
    init_tracing();
    let procs = group(&["a", "b", "c"], "a");
    procs[0].inject_input(Tiers::from(set(&["mon"])));
    procs[1].inject_input(Tiers::from(set(&["tue"])));
    procs[2].inject_input(Tiers::from(set(&["wed"])));
    let decisions = decide(&procs).await;
    for d in decisions.iter() {
        assert!(d.choices.is_empty());
        assert_eq!(d.outcome, Outcome::RoundCapReached { rounds: DEFAULT_ROUND_CAP });
        assert!(!d.is_agreement());
    }
    assert_eq!(procs[0].round(), DEFAULT_ROUND_CAP);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn configured_round_cap_is_honoured() {
    init_tracing();
    let cfg = Cfg::new(pids(&["a", "b"]), "b")
        .and_then(|c| c.with_round_cap(2))
        .expect("valid cfg");
    let procs = group_with(cfg);
    procs[0].inject_input(Tiers::from(set(&["x"])));
    procs[1].inject_input(Tiers::from(set(&["y"])));
    let decisions = decide(&procs).await;
    assert_eq!(decisions[0].outcome, Outcome::RoundCapReached { rounds: 2 });
    assert_eq!(procs[1].round(), 2);
    assert_eq!(procs[0].round(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn perception_exchange_moves_the_outlier() {
    init_tracing();
    let procs = group(&["a", "b", "c"], "a");
    procs[0].inject_input(Tiers::from(set(&["7pm"])));
    procs[1].inject_input(Tiers::new(vec![set(&["8pm"]), set(&["7pm"])]));
    procs[2].inject_input(Tiers::from(set(&["7pm", "9pm"])));
    let decisions = decide(&procs).await;
    for d in decisions.iter() {
        assert_eq!(d.choices, set(&["7pm"]));
        assert_eq!(d.outcome, Outcome::Agreed { round: 2 });
    }
    let b = procs[1].latest_opinion().await.expect("b reported");
    assert_eq!(b.choices, set(&["7pm", "8pm"]));
    assert_eq!(b.context.relaxation, 1);
    assert!(b.context.exhausted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn choice_requests_wait_for_input() {
    init_tracing();
    let procs = group(&["a", "b", "c"], "c");
    procs[0].inject_input(Tiers::from(set(&["lunch"])));
    procs[2].inject_input(Tiers::from(set(&["lunch", "dinner"])));
    assert_eq!(procs[1].stage(), Stage::AwaitingInput);

    let leader = procs[2].clone();
    let driver = tokio::spawn(async move { leader.start().await });
    sleep(Duration::from_millis(100)).await;
    assert_eq!(procs[2].stage(), Stage::RoundActive);
    assert_eq!(procs[2].round(), 1);
    assert!(procs[0].final_choices().is_none());

    procs[1].inject_input(Tiers::from(set(&["lunch"])));
    let d = timeout(Duration::from_secs(10), procs[0].await_final_choices())
        .await
        .expect("agreement stalled")
        .expect("decision");
    assert_eq!(d.choices, set(&["lunch"]));
    assert_eq!(d.outcome, Outcome::Agreed { round: 1 });
    driver.await.expect("driver panicked").expect("driver failed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn back_to_back_commits_keep_the_first() {
    init_tracing();
    let commit = |choices: ArcOrdSet<String>| -> QParamsOf<Engine> {
        QParams::Commit {
            choices,
            outcome: Outcome::Agreed { round: 1 },
        }
    };
    let b = vec![Pid::from("b")];
    for _ in 0..200 {
        let procs = group(&["a", "b"], "a");
        let leader = procs[0].router();
        leader
            .send_request(&b, QMessage::Commit, commit(set(&["first"])), None)
            .await
            .expect("send");
        leader
            .send_request(&b, QMessage::Commit, commit(set(&["second"])), None)
            .await
            .expect("send");
        let d = timeout(Duration::from_secs(5), procs[1].await_final_choices())
            .await
            .expect("commit never arrived")
            .expect("decision");
        assert_eq!(d.choices, set(&["first"]));
    }
}

#[tokio::test]
async fn failed_start_can_be_retried_from_round_one() {
    init_tracing();
    let mut procs = group(&["a", "b"], "a");
    procs[0].inject_input(Tiers::from(set(&["x"])));
    // Dropping b takes its router and links with it.
    drop(procs.pop());
    let leader = &procs[0];
    assert_eq!(
        leader.start().await.err(),
        Some(QProcError::Router(RouterError::PeerClosed(Pid::from("b"))))
    );
    assert_eq!(leader.round(), 0);
    assert_eq!(leader.stage(), Stage::Ready);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commit_from_non_leader_is_ignored() {
    init_tracing();
    let procs = group(&["a", "b", "c"], "a");
    let commit = |choices: ArcOrdSet<String>| -> QParamsOf<Engine> {
        QParams::Commit {
            choices,
            outcome: Outcome::Agreed { round: 1 },
        }
    };
    let b = vec![Pid::from("b")];
    procs[2]
        .router()
        .send_request(&b, QMessage::Commit, commit(set(&["rogue"])), None)
        .await
        .expect("send");
    procs[0]
        .router()
        .send_request(&b, QMessage::Commit, commit(set(&["real"])), None)
        .await
        .expect("send");
    let d = timeout(Duration::from_secs(5), procs[1].await_final_choices())
        .await
        .expect("commit never arrived")
        .expect("decision");
    assert_eq!(d.choices, set(&["real"]));
}

#[tokio::test]
async fn followers_do_not_drive() {
    let procs = group(&["a", "b"], "a");
    procs[1].start().await.expect("start");
    assert_eq!(procs[1].round(), 0);
    assert_eq!(procs[1].stage(), Stage::AwaitingInput);
}

#[tokio::test]
async fn participant_rejects_bad_wiring() {
    let cfg = Cfg::new(pids(&["a", "b"]), "a").expect("valid cfg");
    let mut routers = local::mesh::<QMessage, QParamsOf<Engine>>(&pids(&["a", "b"])).expect("mesh");

    let outsider = QRouter::<Engine>::new("z");
    assert!(matches!(
        QProc::new("z", outsider, cfg.clone(), Engine::new()),
        Err(QProcError::NotAMember { .. })
    ));

    let a_router = routers.remove(&Pid::from("a")).expect("router");
    assert!(matches!(
        QProc::new("b", a_router, cfg.clone(), Engine::new()),
        Err(QProcError::RouterMismatch { .. })
    ));

    let mut lonely = QRouter::<Engine>::new("a");
    lonely
        .register_link("a", LocalLink::<QMessage, QParamsOf<Engine>>::new())
        .expect("register");
    assert_eq!(
        QProc::new("a", lonely, cfg, Engine::new()).err(),
        Some(QProcError::Router(RouterError::UnknownPeer(Pid::from("b"))))
    );
}

// Router-level tests use a one-kind greeting protocol.

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
enum Hello {
    Greet,
}

impl MessageKind for Hello {
    const ALL: &'static [Self] = &[Hello::Greet];
}

// Serve `router` with a greeting handler that logs what it hears and
// answers every greeting `replies` times.
fn serve_greeter(
    router: &Arc<Router<Hello, String>>,
    heard: Arc<StdMutex<Vec<(Pid, String)>>>,
    replies: usize,
) {
    let me = router.clone();
    let handlers = HandlerTable::new()
        .on(Hello::Greet, move |src: Pid, id, msg: String| {
            let me = me.clone();
            let heard = heard.clone();
            async move {
                heard.lock().unwrap().push((src.clone(), msg));
                for _ in 0..replies {
                    me.send_response(&src, id, format!("hello back from {}", me.pid()))
                        .expect("reply");
                }
            }
        })
        .build()
        .expect("complete table");
    router.serve(handlers).expect("serve");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_router_greets_every_other() {
    init_tracing();
    let members = pids(&["0", "1", "3"]);
    let routers: Vec<Arc<Router<Hello, String>>> = local::mesh(&members)
        .expect("mesh")
        .into_values()
        .map(Arc::new)
        .collect();
    let heard = Arc::new(StdMutex::new(Vec::new()));
    for r in routers.iter() {
        serve_greeter(r, heard.clone(), 1);
    }

    for r in routers.iter() {
        let others: Vec<Pid> = members.iter().filter(|p| *p != r.pid()).cloned().collect();
        let acc = Arc::new(ResponseAccumulator::count(others.len()));
        r.send_request(&others, Hello::Greet, format!("hi from {}", r.pid()), Some(acc.clone()))
            .await
            .expect("send");
        let replies = timeout(Duration::from_secs(5), acc.wait_for())
            .await
            .expect("replies stalled");
        assert_eq!(replies.len(), 2);
        for (src, reply) in replies.iter() {
            assert_eq!(reply, &format!("hello back from {}", src));
        }
        assert_eq!(r.in_flight().await, 0);
    }
    assert_eq!(heard.lock().unwrap().len(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn requests_on_one_link_run_in_send_order() {
    init_tracing();
    let members = pids(&["a", "b"]);
    let mut routers = local::mesh::<Hello, String>(&members).expect("mesh");
    let a = Arc::new(routers.remove(&Pid::from("a")).expect("a"));
    let b = Arc::new(routers.remove(&Pid::from("b")).expect("b"));
    let heard = Arc::new(StdMutex::new(Vec::new()));
    serve_greeter(&a, heard.clone(), 0);
    serve_greeter(&b, heard.clone(), 1);

    let sent: Vec<String> = (0..100).map(|i| format!("hi #{}", i)).collect();
    let acc = Arc::new(ResponseAccumulator::count(1));
    for (i, msg) in sent.iter().enumerate() {
        let last = i + 1 == sent.len();
        a.send_request(&pids(&["b"]), Hello::Greet, msg.clone(), last.then(|| acc.clone()))
            .await
            .expect("send");
    }
    timeout(Duration::from_secs(5), acc.wait_for())
        .await
        .expect("last greeting never answered");
    let heard: Vec<String> = heard.lock().unwrap().iter().map(|(_, m)| m.clone()).collect();
    assert_eq!(heard, sent);
}

#[tokio::test]
async fn broadcast_ids_strictly_increase() {
    let mut router: Router<Hello, String> = Router::new("solo");
    let link: Arc<LocalLink<Hello, String>> = LocalLink::new();
    router.register_link("solo", link.clone()).expect("register");
    LocalLink::pair(&link, &link);
    let me = vec![Pid::from("solo")];

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(
            router
                .send_request(&me, Hello::Greet, i.to_string(), None)
                .await
                .expect("send"),
        );
    }
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn unpaired_link_is_fatal() {
    let mut router: Router<Hello, String> = Router::new("a");
    let link: Arc<LocalLink<Hello, String>> = LocalLink::new();
    router.register_link("b", link.clone()).expect("register");
    assert!(!link.is_connected());

    let acc = Arc::new(ResponseAccumulator::count(1));
    let sent = router
        .send_request(&pids(&["b"]), Hello::Greet, "hi".into(), Some(acc))
        .await;
    assert_eq!(sent, Err(RouterError::LinkNotConnected(Pid::from("b"))));
    assert_eq!(router.in_flight().await, 0);

    assert_eq!(
        router.send_response(&Pid::from("b"), 1, "hi".into()),
        Err(RouterError::LinkNotConnected(Pid::from("b")))
    );
    assert_eq!(
        router
            .send_request(&pids(&["nobody"]), Hello::Greet, "hi".into(), None)
            .await,
        Err(RouterError::UnknownPeer(Pid::from("nobody")))
    );
    assert_eq!(
        router.register_link("b", LocalLink::<Hello, String>::new()),
        Err(RouterError::DuplicateLink(Pid::from("b")))
    );
}

#[test]
fn incomplete_handler_table_is_rejected() {
    let table: HandlerTable<QMessage, ()> = HandlerTable::new()
        .on(QMessage::GetChoices, |_, _, _| async {})
        .on(QMessage::Commit, |_, _, _| async {})
        .on(QMessage::PerExc, |_, _, _| async {});
    assert_eq!(
        table.build().err(),
        Some(RouterError::MissingHandler("InitPerExc".into()))
    );
}

#[tokio::test]
async fn serving_twice_is_rejected() {
    let router: Router<Hello, String> = Router::new("a");
    let table = || {
        HandlerTable::<Hello, String>::new()
            .on(Hello::Greet, |_, _, _| async {})
            .build()
            .expect("complete table")
    };
    router.serve(table()).expect("first serve");
    assert_eq!(router.serve(table()), Err(RouterError::AlreadyServing));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_and_stray_responses_are_dropped() {
    init_tracing();
    let members = pids(&["a", "b"]);
    let mut routers = local::mesh::<Hello, String>(&members).expect("mesh");
    let a = Arc::new(routers.remove(&Pid::from("a")).expect("a"));
    let b = Arc::new(routers.remove(&Pid::from("b")).expect("b"));
    let heard = Arc::new(StdMutex::new(Vec::new()));
    serve_greeter(&a, heard.clone(), 1);
    // b answers every greeting three times.
    serve_greeter(&b, heard.clone(), 3);

    // A reply nobody asked for.
    b.send_response(&Pid::from("a"), 999, "stray".into())
        .expect("send");

    for round in 0..2 {
        let acc = Arc::new(ResponseAccumulator::count(1));
        a.send_request(&pids(&["b"]), Hello::Greet, format!("hi #{}", round), Some(acc.clone()))
            .await
            .expect("send");
        let replies = timeout(Duration::from_secs(5), acc.wait_for())
            .await
            .expect("reply stalled");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[&Pid::from("b")], "hello back from b");
    }
    sleep(Duration::from_millis(50)).await;
    assert_eq!(a.in_flight().await, 0);
}

#[test]
fn envelope_wire_shape() {
    type Params = QParamsOf<Engine>;
    let req: Envelope<QMessage, Params> = Envelope::request(
        QMessage::PerExc,
        7,
        QParams::PerceptionExchange {
            context: DiscreteContext::default(),
            choices: set(&["7pm"]),
        },
    );
    let v = serde_json::to_value(&req).expect("serialize");
    assert_eq!(v["message_type"], "PER_EXC");
    assert_eq!(v["broadcast_id"], 7);
    assert_eq!(v["params"]["perception_exchange"]["choices"][0], "7pm");

    let resp: Envelope<QMessage, Params> = Envelope::response(7, QParams::Empty);
    let v = serde_json::to_value(&resp).expect("serialize");
    assert!(v.get("message_type").is_none());

    let back: Envelope<QMessage, Params> =
        serde_json::from_str(r#"{"broadcast_id": 9, "params": "empty"}"#).expect("deserialize");
    assert!(!back.is_request());
    assert_eq!(back.broadcast_id, 9);
    assert_eq!(back.params, QParams::Empty);
}

#[test]
fn cfg_validation() {
    assert_eq!(
        Cfg::new(Vec::<Pid>::new(), "a").err(),
        Some(ConfigError::NoMembers)
    );
    assert_eq!(
        Cfg::new(pids(&["a", "b", "a"]), "a").err(),
        Some(ConfigError::DuplicateMember(Pid::from("a")))
    );
    assert_eq!(
        Cfg::new(pids(&["a", "b"]), "c").err(),
        Some(ConfigError::LeaderNotMember(Pid::from("c")))
    );
    let cfg = Cfg::new(pids(&["a", "b", "c"]), "b").expect("valid cfg");
    assert_eq!(cfg.round_cap(), DEFAULT_ROUND_CAP);
    assert_eq!(cfg.others(&Pid::from("b")), pids(&["a", "c"]));
    assert_eq!(cfg.clone().with_round_cap(0).err(), Some(ConfigError::ZeroRoundCap));

    let loaded: Cfg =
        serde_json::from_str(r#"{"members": ["x", "y"], "leader": "y"}"#).expect("deserialize");
    assert!(loaded.validate().is_ok());
    assert_eq!(loaded.round_cap(), DEFAULT_ROUND_CAP);
    assert!(loaded.is_leader(&Pid::from("y")));
}
