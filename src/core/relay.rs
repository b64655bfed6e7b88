use std::fmt;

/// Handle returned by [`ChangeRelay::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Box<dyn FnMut(&str) + Send>;

/// Forwards buffer text to subscribers on every edit.
///
/// Delivery is synchronous and in subscription order. The relay never
/// triggers execution.
#[derive(Default)]
pub struct ChangeRelay {
    next_id: u64,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
}

impl ChangeRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, on_code_change: F) -> SubscriptionId
    where
        F: FnMut(&str) + Send + 'static,
    {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.push((id, Box::new(on_code_change)));
        id
    }

    /// Returns false if the id was not subscribed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(subscribed, _)| *subscribed != id);
        self.subscribers.len() != before
    }

    pub fn publish(&mut self, text: &str) {
        for (_, subscriber) in self.subscribers.iter_mut() {
            subscriber(text);
        }
    }
}

impl fmt::Debug for ChangeRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeRelay")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl FnMut(&str) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |text: &str| sink.lock().unwrap().push(text.to_string()))
    }

    #[test]
    fn test_publish_reaches_every_subscriber() {
        let mut relay = ChangeRelay::new();
        let (form, on_form) = recorder();
        let (assistant, on_assistant) = recorder();
        relay.subscribe(on_form);
        relay.subscribe(on_assistant);

        relay.publish("print(1)");
        relay.publish("print(12)");

        assert_eq!(*form.lock().unwrap(), vec!["print(1)", "print(12)"]);
        assert_eq!(*assistant.lock().unwrap(), vec!["print(1)", "print(12)"]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let mut relay = ChangeRelay::new();
        let (seen, on_change) = recorder();
        let id = relay.subscribe(on_change);

        relay.publish("a");
        assert!(relay.unsubscribe(id));
        assert!(!relay.unsubscribe(id));
        relay.publish("b");

        assert_eq!(*seen.lock().unwrap(), vec!["a"]);
        assert!(relay.subscribers.is_empty());
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let mut relay = ChangeRelay::new();
        relay.publish("x = 1");
        assert_eq!(format!("{:?}", relay), "ChangeRelay { subscribers: 0 }");
    }
}
