//! End-to-end queue flow

use relaybot::{ChatKey, NewTask, TaskQueue};

fn task(prompt: &str) -> NewTask {
    NewTask {
        prompt: prompt.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_three_tasks_dispatch_and_complete_in_order() {
    let queue = TaskQueue::new(10, 10_000);
    let chat = ChatKey::telegram("X");

    for prompt in ["one", "two", "three"] {
        queue.enqueue(&chat, task(prompt)).await.unwrap();
    }

    let mut seen = Vec::new();
    while let Some(t) = queue.dispatch_next(&chat).await {
        seen.push(t.prompt.clone());
        queue.complete(&chat, &t.id).await;
    }

    assert_eq!(seen, vec!["one", "two", "three"]);

    let status = queue.status(&chat).await;
    assert_eq!(status.queue_length, 0);
    assert!(!status.is_processing);
}

#[tokio::test]
async fn test_queues_do_not_interfere_across_chats() {
    let queue = TaskQueue::new(2, 10_000);
    let a = ChatKey::telegram("a");
    let b = ChatKey::feishu("b");

    // Fill chat a to its cap; chat b still accepts
    queue.enqueue(&a, task("1")).await.unwrap();
    queue.enqueue(&a, task("2")).await.unwrap();
    assert!(queue.enqueue(&a, task("3")).await.is_err());
    assert!(queue.enqueue(&b, task("1")).await.is_ok());
}

#[tokio::test]
async fn test_cancel_then_drain_rest_of_queue() {
    let queue = TaskQueue::new(10, 10_000);
    let chat = ChatKey::telegram("drain");

    for prompt in ["a", "b", "c"] {
        queue.enqueue(&chat, task(prompt)).await.unwrap();
    }

    let first = queue.dispatch_next(&chat).await.unwrap();
    assert_eq!(first.prompt, "a");
    let outcome = queue.cancel_current(&chat).await;
    assert_eq!(outcome.task_id.as_deref(), Some(first.id.as_str()));

    let mut rest = Vec::new();
    while let Some(t) = queue.dispatch_next(&chat).await {
        rest.push(t.prompt.clone());
        queue.complete(&chat, &t.id).await;
    }
    assert_eq!(rest, vec!["b", "c"]);
}
