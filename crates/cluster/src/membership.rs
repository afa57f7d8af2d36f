//! Gossip membership table
//!
//! Every node owns a monotonically increasing heartbeat for its own entry and
//! is the only writer of it. Peers merge views by heartbeat: a higher counter
//! always wins. A peer whose heartbeat stops advancing for `fail_after` is
//! marked failed locally; failed peers are reaped after `reap_after`. A node
//! that leaves gracefully publishes a `Left` entry which is kept as a
//! tombstone for `tombstone_after`, so stale gossip cannot resurrect it.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Liveness of a member as seen by this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    Alive,
    Failed,
    Left,
}

/// Topic and channel a member has subscribers on
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    pub topic: String,
    pub channel: String,
}

impl ChannelKey {
    pub fn new(topic: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            channel: channel.into(),
        }
    }
}

/// Serializable member entry carried by gossip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberView {
    pub name: String,
    pub address: String,
    pub heartbeat: u64,
    pub state: MemberState,
    #[serde(default)]
    pub channels: BTreeSet<ChannelKey>,
}

#[derive(Debug, Clone)]
struct Member {
    view: MemberView,
    /// Last time the heartbeat advanced or the state changed
    changed_at: Instant,
}

/// Timing of failure detection
#[derive(Debug, Clone, Copy)]
pub struct MembershipTimeouts {
    pub fail_after: Duration,
    pub reap_after: Duration,
    pub tombstone_after: Duration,
}

impl Default for MembershipTimeouts {
    fn default() -> Self {
        Self {
            fail_after: Duration::from_secs(10),
            reap_after: Duration::from_secs(60),
            tombstone_after: Duration::from_secs(120),
        }
    }
}

/// Change observed while merging or ticking
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberEvent {
    Joined(String),
    Failed(String),
    Recovered(String),
    Left(String),
    Reaped(String),
}

/// Membership table of one node
#[derive(Debug)]
pub struct Membership {
    local: Member,
    /// Peers, never the local node
    members: HashMap<String, Member>,
    timeouts: MembershipTimeouts,
}

impl Membership {
    pub fn new(name: &str, address: &str, timeouts: MembershipTimeouts) -> Self {
        Self {
            local: Member {
                view: MemberView {
                    name: name.to_string(),
                    address: address.to_string(),
                    heartbeat: 1,
                    state: MemberState::Alive,
                    channels: BTreeSet::new(),
                },
                changed_at: Instant::now(),
            },
            members: HashMap::new(),
            timeouts,
        }
    }

    pub fn local_name(&self) -> &str {
        &self.local.view.name
    }

    fn all(&self) -> impl Iterator<Item = &Member> {
        std::iter::once(&self.local).chain(self.members.values())
    }

    /// Advance the local heartbeat
    pub fn beat(&mut self) {
        self.local.view.heartbeat += 1;
        self.local.changed_at = Instant::now();
    }

    /// Record a channel subscription of this node
    pub fn add_channel(&mut self, key: ChannelKey) {
        if self.local.view.channels.insert(key) {
            self.beat();
        }
    }

    pub fn remove_channel(&mut self, key: &ChannelKey) {
        if self.local.view.channels.remove(key) {
            self.beat();
        }
    }

    /// Mark this node as leaving
    pub fn leave(&mut self) {
        self.local.view.state = MemberState::Left;
        self.local.view.channels.clear();
        self.beat();
    }

    /// Entries worth gossiping: alive members and tombstones
    pub fn views(&self) -> Vec<MemberView> {
        let mut views: Vec<MemberView> = self
            .all()
            .filter(|m| m.view.state != MemberState::Failed)
            .map(|m| m.view.clone())
            .collect();
        views.sort_by(|a, b| a.name.cmp(&b.name));
        views
    }

    /// Alive members including this node
    pub fn alive(&self) -> Vec<MemberView> {
        let mut alive: Vec<MemberView> = self
            .all()
            .filter(|m| m.view.state == MemberState::Alive)
            .map(|m| m.view.clone())
            .collect();
        alive.sort_by(|a, b| a.name.cmp(&b.name));
        alive
    }

    pub fn get(&self, name: &str) -> Option<&MemberView> {
        if name == self.local.view.name {
            return Some(&self.local.view);
        }
        self.members.get(name).map(|m| &m.view)
    }

    pub fn address_of(&self, name: &str) -> Option<String> {
        self.get(name).map(|m| m.address.clone())
    }

    /// Alive nodes that have subscribers for each channel of `topic`
    pub fn channel_nodes(&self, topic: &str) -> HashMap<String, Vec<String>> {
        let mut out: HashMap<String, Vec<String>> = HashMap::new();
        for member in self.all() {
            if member.view.state != MemberState::Alive {
                continue;
            }
            for key in member.view.channels.iter().filter(|k| k.topic == topic) {
                out.entry(key.channel.clone())
                    .or_default()
                    .push(member.view.name.clone());
            }
        }
        for nodes in out.values_mut() {
            nodes.sort();
        }
        out
    }

    /// Merge views received from a peer
    pub fn merge(&mut self, views: Vec<MemberView>) -> Vec<MemberEvent> {
        let now = Instant::now();
        let mut events = Vec::new();

        for view in views {
            if view.name == self.local.view.name {
                // Only this node writes its own entry; refute anything newer
                let newer = view.heartbeat > self.local.view.heartbeat;
                let contested =
                    view.heartbeat == self.local.view.heartbeat && view.state != MemberState::Alive;
                if (newer || contested) && self.local.view.state == MemberState::Alive {
                    self.local.view.heartbeat = view.heartbeat + 1;
                    self.local.changed_at = now;
                }
                continue;
            }

            match self.members.get_mut(&view.name) {
                None => {
                    if view.state == MemberState::Alive {
                        events.push(MemberEvent::Joined(view.name.clone()));
                    }
                    self.members.insert(
                        view.name.clone(),
                        Member {
                            view,
                            changed_at: now,
                        },
                    );
                }
                Some(member) => {
                    if view.heartbeat <= member.view.heartbeat {
                        continue;
                    }
                    if member.view.state == MemberState::Left {
                        // Tombstoned; a restarted node must come back with a fresh name
                        continue;
                    }
                    match (member.view.state, view.state) {
                        (MemberState::Failed, MemberState::Alive) => {
                            events.push(MemberEvent::Recovered(view.name.clone()))
                        }
                        (_, MemberState::Left) => events.push(MemberEvent::Left(view.name.clone())),
                        _ => {}
                    }
                    member.view = view;
                    member.changed_at = now;
                }
            }
        }
        events
    }

    /// Run failure detection, reaping and tombstone expiry
    pub fn tick(&mut self) -> Vec<MemberEvent> {
        let now = Instant::now();
        let timeouts = self.timeouts;
        let mut events = Vec::new();

        let mut remove = Vec::new();
        for (name, member) in self.members.iter_mut() {
            let idle = now.saturating_duration_since(member.changed_at);
            match member.view.state {
                MemberState::Alive if idle >= timeouts.fail_after => {
                    member.view.state = MemberState::Failed;
                    member.changed_at = now;
                    events.push(MemberEvent::Failed(name.clone()));
                }
                MemberState::Failed if idle >= timeouts.reap_after => {
                    remove.push(name.clone());
                    events.push(MemberEvent::Reaped(name.clone()));
                }
                MemberState::Left if idle >= timeouts.tombstone_after => {
                    remove.push(name.clone());
                }
                _ => {}
            }
        }
        for name in remove {
            self.members.remove(&name);
        }
        events
    }
}
