/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: src/shutdown.rs
 *
 * A cooperative shutdown signal observed by the long-running tasks at each
 * of their suspension points: waiting for the next watch event, sleeping
 * between two reconciliation passes, and polling during a stabilization
 * window.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use tokio::sync::watch;

/// Triggering side, owned by `main`.
pub struct ShutdownTrigger(watch::Sender<bool>);

/// Observing side, cloned into every task.
#[derive(Clone)]
pub struct Shutdown(watch::Receiver<bool>);

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), Shutdown(rx))
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown(self.0.subscribe())
    }
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown has been triggered. Also resolves when the
    /// trigger was dropped, so a task can never outlive `main`.
    pub async fn triggered(&mut self) {
        let _ = self.0.wait_for(|stop| *stop).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_wakes_every_observer() {
        let (trigger, shutdown) = channel();
        let mut a = shutdown.clone();
        let mut b = trigger.subscribe();
        assert!(!a.is_triggered());

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), a.triggered()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), b.triggered()).await.unwrap();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_dropped_trigger_releases_observers() {
        let (trigger, mut shutdown) = channel();
        drop(trigger);
        tokio::time::timeout(Duration::from_secs(1), shutdown.triggered()).await.unwrap();
    }
}
