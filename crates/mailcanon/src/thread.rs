//! Collapse a long, mostly-read thread into display groups.
//!
//! The number of always-visible messages is bounded regardless of thread
//! length: the first message, the last few read ones and the final
//! message are always shown, the middle collapses.

/// How many trailing read messages stay visible before the last one.
pub const DEFAULT_TAIL_SIZE: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadGroup<'a, M> {
    pub collapsed: bool,
    pub messages: Vec<&'a M>,
}

/// Partition a thread's messages (ordered by arrival) into display
/// groups. Pure: recomputed on every display request.
pub fn group_messages<'a, M, F>(
    messages: &'a [M],
    is_unread: F,
    tail_size: usize,
) -> Vec<ThreadGroup<'a, M>>
where
    F: Fn(&M) -> bool,
{
    let Some((last, prefix)) = messages.split_last() else {
        return vec![];
    };

    // run-length partition of the prefix by unread state
    let mut groups: Vec<ThreadGroup<'a, M>> = Vec::new();
    for msg in prefix {
        let collapsed = !is_unread(msg);
        match groups.last_mut() {
            Some(group) if group.collapsed == collapsed => group.messages.push(msg),
            _ => groups.push(ThreadGroup {
                collapsed,
                messages: vec![msg],
            }),
        }
    }

    // surface the last few messages of a long trailing read run
    let tail = match groups.last_mut() {
        Some(last_group) if last_group.collapsed && last_group.messages.len() > tail_size => {
            let at = last_group.messages.len() - tail_size;
            Some(last_group.messages.split_off(at))
        }
        _ => None,
    };
    if let Some(messages) = tail {
        groups.push(ThreadGroup {
            collapsed: false,
            messages,
        });
    }

    // the thread opener is always shown
    let opener = match groups.first_mut() {
        Some(first_group) if first_group.collapsed && first_group.messages.len() > 1 => {
            let rest = first_group.messages.split_off(1);
            Some(std::mem::replace(&mut first_group.messages, rest))
        }
        _ => None,
    };
    if let Some(messages) = opener {
        groups.insert(
            0,
            ThreadGroup {
                collapsed: false,
                messages,
            },
        );
    }

    // the latest message is always shown, individually
    groups.push(ThreadGroup {
        collapsed: false,
        messages: vec![last],
    });
    groups
}
