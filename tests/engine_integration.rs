//! End-to-end engine behaviour against the in-memory mailbox, sender and
//! fetcher.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use mailbot::engine::{Collaborators, LoopSettings, PassFailure, run_forever, run_once};
use mailbot::error::ActionError;
use mailbot::handlers::{
    ForwardAction, Handler, HandlerKind, LocalizedText, ProxyAction, RejectAction,
};
use mailbot::mailbox::{MailboxSession, MailboxTransport, MessageId};
use mailbot::proxy::{ContentProxy, FetchedContent, ProxySettings, UrlCache};
use mailbot::rules::{Predicate, RuleTable, SearchCapabilities, SearchCriterion};
use mailbot::testing::{
    FailOp, MemoryMailbox, RecordingSender, StaticFetcher, WaitOutcome, raw_message,
};

fn sender() -> (Arc<RecordingSender>, Collaborators) {
    let sender = Arc::new(RecordingSender::new());
    (sender.clone(), Collaborators::new(sender))
}

fn spam_then_work() -> RuleTable {
    RuleTable::new(SearchCapabilities::IMAP)
        .with_rule(
            "spam",
            Predicate::froms(["@spam.test"]),
            Handler::ObnoxiousReject(RejectAction {
                from: "bot@x.test".into(),
                body: LocalizedText::english("Your message to {sender} was not read."),
            }),
        )
        .with_rule(
            "work",
            Predicate::froms(["@work.test", "@spam.test"]),
            Handler::Forward(ForwardAction {
                to: "work@x.test".into(),
                from: "bot@x.test".into(),
                note: LocalizedText::english("Forwarded message from {sender}"),
                auto_reply: None,
                archive_to: None,
            }),
        )
}

#[tokio::test]
async fn earliest_matching_rule_is_the_only_one_to_fire() {
    let mailbox = MemoryMailbox::new();
    let id = mailbox.add(&raw_message("a@spam.test", "me@x.test", "Buy now", "cheap"));
    let mut session = mailbox.connect().await.unwrap();
    let (sent, collab) = sender();

    let report = run_once(session.as_mut(), &spam_then_work(), &collab).await;

    assert!(report.is_success());
    assert_eq!(report.processed, [id]);
    assert_eq!(report.matched, 1);
    assert!(!mailbox.exists(id));
    let sent = sent.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "a@spam.test");
    assert_eq!(sent[0].subject, "Re: Buy now");
    assert!(sent.iter().all(|m| m.to != "work@x.test"));
}

#[tokio::test]
async fn spammer_is_rejected_once_when_delete_is_retried() {
    let mailbox = MemoryMailbox::new();
    let id = mailbox.add(&raw_message("a@spam.test", "me@x.test", "Buy now", "cheap"));
    mailbox.fail(FailOp::Delete, id);
    let mut session = mailbox.connect().await.unwrap();
    let (sent, collab) = sender();
    let table = spam_then_work();

    let first = run_once(session.as_mut(), &table, &collab).await;
    assert!(!first.is_success());
    assert!(mailbox.exists(id));

    mailbox.clear_failures();
    let second = run_once(session.as_mut(), &table, &collab).await;

    assert!(second.is_success());
    assert!(!mailbox.exists(id));
    assert_eq!(sent.sent().len(), 1);
}

#[tokio::test]
async fn work_mail_is_forwarded() {
    let mailbox = MemoryMailbox::new();
    let id = mailbox.add(&raw_message("boss@work.test", "me@x.test", "Standup", "9am"));
    let mut session = mailbox.connect().await.unwrap();
    let (sent, collab) = sender();

    run_once(session.as_mut(), &spam_then_work(), &collab).await;

    let sent = sent.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "work@x.test");
    assert_eq!(sent[0].attachments[0].content_type, "message/rfc822");
    assert!(mailbox.is_seen(id));
}

#[tokio::test]
async fn negated_recipient_excludes_private_copies() {
    for caps in [SearchCapabilities::IMAP, SearchCapabilities::CONJUNCTIVE_ONLY] {
        let mailbox = MemoryMailbox::with_capabilities(caps);
        let private = mailbox.add(&raw_message("x@news.test", "y@private.test", "Digest", ""));
        let public = mailbox.add(&raw_message("x@news.test", "list@public.test", "Digest", ""));
        let mut session = mailbox.connect().await.unwrap();
        let (_, collab) = sender();
        let table = RuleTable::new(mailbox.capabilities()).with_rule(
            "news",
            Predicate::AllOf(vec![
                Predicate::froms(["@news.test"]),
                Predicate::not(Predicate::tos(["@private.test"])),
            ]),
            Handler::Move {
                folder: "News".into(),
            },
        );

        let report = run_once(session.as_mut(), &table, &collab).await;

        assert_eq!(report.processed, [private, public], "{caps:?}");
        assert_eq!(report.matched, 1, "{caps:?}");
        assert_eq!(mailbox.folder_of(private).as_deref(), Some("INBOX"));
        assert_eq!(mailbox.folder_of(public).as_deref(), Some("News"));
    }
}

#[tokio::test]
async fn failed_message_and_its_successors_wait_for_the_next_pass() {
    let mailbox = MemoryMailbox::new();
    for id in [5, 6, 7] {
        mailbox.add_with_id(
            MessageId(id),
            &raw_message("a@x.test", "me@x.test", &format!("m{id}"), ""),
        );
    }
    mailbox.fail_move(MessageId(6));
    let mut session = mailbox.connect().await.unwrap();
    let (_, collab) = sender();
    let table = RuleTable::new(SearchCapabilities::IMAP).with_rule(
        "file",
        Predicate::AllOf(vec![]),
        Handler::Move {
            folder: "Filed".into(),
        },
    );

    let report = run_once(session.as_mut(), &table, &collab).await;
    assert_eq!(report.processed, [MessageId(5)]);
    match &report.failure {
        Some(PassFailure::Action { rule, handler, error, .. }) => {
            assert_eq!(*rule, 0);
            assert_eq!(*handler, HandlerKind::Move);
            assert!(matches!(error, ActionError::Transient { .. }));
            assert_eq!(error.message_id(), MessageId(6));
        }
        other => panic!("expected action failure, got {other:?}"),
    }
    assert_eq!(mailbox.folder_of(MessageId(7)).as_deref(), Some("INBOX"));

    let unseen = session.search(&SearchCriterion::Unseen).await.unwrap();
    assert_eq!(unseen, [MessageId(6), MessageId(7)]);

    mailbox.clear_failures();
    let report = run_once(session.as_mut(), &table, &collab).await;
    assert!(report.is_success());
    assert_eq!(report.processed, [MessageId(6), MessageId(7)]);
}

#[tokio::test(start_paused = true)]
async fn connect_retries_back_off_and_reset_after_a_pass() {
    let mailbox = MemoryMailbox::new();
    mailbox.add(&raw_message("a@x.test", "me@x.test", "hello", ""));
    mailbox.script_connects([false, false, false, true, false, true]);
    mailbox.script_waits([WaitOutcome::Lost]);
    let (_, collab) = sender();
    let table = RuleTable::new(SearchCapabilities::IMAP).with_rule(
        "archive",
        Predicate::AllOf(vec![]),
        Handler::Archive {
            folder: "Archive".into(),
        },
    );
    let settings = LoopSettings::default();
    let (tx, rx) = watch::channel(false);

    let start = tokio::time::Instant::now();
    let stopper = async {
        tokio::time::sleep(Duration::from_secs(1000)).await;
        tx.send(true).unwrap();
    };
    let (state, ()) = tokio::join!(
        run_forever(&mailbox, &table, &collab, &settings, rx),
        stopper
    );

    let offsets: Vec<u64> = mailbox
        .connect_times()
        .iter()
        .map(|t| t.duration_since(start).as_secs())
        .collect();
    // Delays 60, 120, 240; then a pass, a lost connection, one failure
    // that waits the floor again.
    assert_eq!(offsets, [0, 60, 180, 420, 420, 480]);
    assert_eq!(state.passes, 2);
    assert_eq!(state.consecutive_failures, 0);
}

#[tokio::test]
async fn proxy_request_uses_cache_on_repeat() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(StaticFetcher::new());
    fetcher.insert(FetchedContent::new(
        "https://x.test/article",
        "text/html; charset=utf-8",
        b"<html><head><title>Article</title></head><body><p>Hello world</p></body></html>"
            .to_vec(),
    ));
    let mut settings = ProxySettings::new("proxy@x.test");
    settings.kindle_send_to = Some("me@kindle.test".into());
    let proxy = ContentProxy::new(settings, UrlCache::new(dir.path()), fetcher.clone());

    let mailbox = MemoryMailbox::new();
    let to = "txt+bleach+kindle+proxy@x.test";
    let first = mailbox.add(&raw_message("me@x.test", to, "read", "https://x.test/article"));
    let second = mailbox.add(&raw_message("me@x.test", to, "again", "https://x.test/article"));
    let mut session = mailbox.connect().await.unwrap();
    let (sent, collab) = sender();
    let collab = collab.with_proxy(Arc::new(proxy));
    let table = RuleTable::new(SearchCapabilities::IMAP).with_rule(
        "proxy",
        Predicate::to("+proxy@"),
        Handler::ContentProxy(ProxyAction::default()),
    );

    let report = run_once(session.as_mut(), &table, &collab).await;

    assert!(report.is_success());
    assert_eq!(report.matched, 2);
    assert!(mailbox.is_seen(first) && mailbox.is_seen(second));
    assert_eq!(fetcher.calls("https://x.test/article"), 1);
    let sent = sent.sent();
    assert_eq!(sent.len(), 2);
    for msg in &sent {
        assert_eq!(msg.to, "me@kindle.test");
        assert_eq!(msg.subject, "[TLB]: Article");
        assert!(msg.attachments[0].filename.ends_with(".txt"));
    }
}

#[tokio::test]
async fn proxy_rule_without_proxy_fails_permanently() {
    let mailbox = MemoryMailbox::new();
    let id = mailbox.add(&raw_message("me@x.test", "proxy@x.test", "read", "https://x.test/a"));
    let mut session = mailbox.connect().await.unwrap();
    let (_, collab) = sender();
    let table = RuleTable::new(SearchCapabilities::IMAP).with_rule(
        "proxy",
        Predicate::to("proxy@"),
        Handler::ContentProxy(ProxyAction::default()),
    );

    let report = run_once(session.as_mut(), &table, &collab).await;
    match report.failure {
        Some(PassFailure::Action { error, .. }) => assert!(!error.is_transient()),
        other => panic!("expected action failure, got {other:?}"),
    }
    assert!(!mailbox.is_seen(id));
}
