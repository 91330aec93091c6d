//! Operator-driven driver
//!
//! Every operation becomes a prompt. Answers are parsed into the expected
//! type; malformed answers are re-prompted up to a bounded number of
//! attempts.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use tracing::debug;

use feditest_common::{
    uri, AccountHandle, AccountProfile, Action, CapabilitySet, Error, NodeConfig, NodeInstance,
    Observation, Result, ResultHandle,
};

use crate::driver::AppDriver;

pub const MANUAL_DRIVER: &str = "manual";

/// Where operator questions go and answers come from
pub trait Prompter: Send + Sync {
    /// Present `question` and return the operator's answer
    fn ask(&self, question: &str) -> io::Result<String>;
}

/// Prompts on stdout, answers from stdin
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsolePrompter;

impl Prompter for ConsolePrompter {
    fn ask(&self, question: &str) -> io::Result<String> {
        {
            let mut out = io::stdout().lock();
            writeln!(out, "TESTER ACTION REQUIRED: {}", question)?;
            out.flush()?;
        }

        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "operator input closed",
            ));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// Answers from a fixed script; records every question asked
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    answers: Mutex<VecDeque<String>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: Mutex::new(answers.into_iter().map(Into::into).collect()),
            asked: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, answer: impl Into<String>) {
        self.answers.lock().push_back(answer.into());
    }

    /// Questions asked so far, in order
    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().clone()
    }

    pub fn remaining(&self) -> usize {
        self.answers.lock().len()
    }
}

impl Prompter for ScriptedPrompter {
    fn ask(&self, question: &str) -> io::Result<String> {
        self.asked.lock().push(question.to_string());
        self.answers.lock().pop_front().ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "script has no more answers")
        })
    }
}

fn http_uri(answer: &str) -> Option<String> {
    uri::http_https_uri(answer).map(|_| answer.trim().to_string())
}

/// Driver that delegates every operation to a human operator
pub struct ManualDriver {
    name: String,
    prompter: Arc<dyn Prompter>,
    max_attempts: u32,
}

impl ManualDriver {
    pub fn new(prompter: Arc<dyn Prompter>, max_attempts: u32) -> Self {
        Self::named(MANUAL_DRIVER, prompter, max_attempts)
    }

    pub fn named(name: impl Into<String>, prompter: Arc<dyn Prompter>, max_attempts: u32) -> Self {
        Self {
            name: name.into(),
            prompter,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Ask until `parse` accepts an answer or attempts run out
    pub async fn ask<T>(&self, question: String, parse: fn(&str) -> Option<T>) -> Result<T>
    where
        T: Send + 'static,
    {
        let prompter = self.prompter.clone();
        let max_attempts = self.max_attempts;

        tokio::task::spawn_blocking(move || -> Result<T> {
            let mut last = String::new();
            for attempt in 1..=max_attempts {
                let prompt = if attempt == 1 {
                    question.clone()
                } else {
                    format!("{} (could not understand {:?}, try again)", question, last)
                };
                let answer = prompter.ask(&prompt)?;
                if let Some(value) = parse(&answer) {
                    return Ok(value);
                }
                debug!(attempt, answer = %answer, "Operator answer rejected");
                last = answer;
            }
            Err(Error::InvalidInput {
                attempts: max_attempts,
                last,
            })
        })
        .await
        .map_err(|e| Error::Other(anyhow::anyhow!("operator prompt task failed: {}", e)))?
    }

    /// Yes/no question; an empty answer means yes
    pub async fn confirm(&self, question: String) -> Result<bool> {
        self.ask(format!("{} [Y/n]", question), uri::boolean_response)
            .await
    }

    async fn hostname_for(&self, role: &str, config: &NodeConfig) -> Result<String> {
        if let Some(hostname) = config.hostname() {
            return uri::hostname(hostname).ok_or_else(|| {
                Error::provision(&self.name, format!("invalid hostname: {}", hostname))
            });
        }
        if let Some(host) = config
            .root_url()
            .and_then(uri::http_https_root_uri)
            .and_then(|u| u.host_str().map(str::to_string))
        {
            return Ok(host);
        }
        self.ask(
            format!("Enter the hostname of the node for role \"{}\":", role),
            uri::hostname,
        )
        .await
    }
}

fn describe_action(node: &NodeInstance, action: &Action) -> String {
    let host = &node.hostname;
    match action {
        Action::CreatePost {
            author,
            content,
            deliver_to,
        } => {
            let mut prompt = format!("On {}, as {}, create a post with content {:?}", host, author, content);
            if !deliver_to.is_empty() {
                prompt.push_str(&format!(" addressed to {}", deliver_to.join(", ")));
            }
            prompt.push_str(". Enter the URI of the new post:");
            prompt
        }
        Action::Reply {
            author,
            in_reply_to,
            content,
        } => format!(
            "On {}, as {}, reply to {} with content {:?}. Enter the URI of the reply:",
            host, author, in_reply_to, content
        ),
        Action::DeletePost { post_id } => format!("On {}, delete the post {}.", host, post_id),
        Action::Announce { actor, object_id } => {
            format!("On {}, as {}, announce (boost) {}.", host, actor, object_id)
        }
        Action::Follow { follower, followee } => {
            format!("On {}, make {} follow {}.", host, follower, followee)
        }
        Action::Unfollow { follower, followee } => {
            format!("On {}, make {} unfollow {}.", host, follower, followee)
        }
        Action::Block { actor, target } => {
            format!("On {}, make {} block {}.", host, actor, target)
        }
    }
}

fn describe_observation(node: &NodeInstance, observation: &Observation) -> String {
    let host = &node.hostname;
    match observation {
        Observation::HasPost { post_id } => format!("Does {} have the post {}?", host, post_id),
        Observation::IsFollowing { follower, followee } => {
            format!("On {}, is {} following {}?", host, follower, followee)
        }
        Observation::IsBlocked { actor, by } => {
            format!("On {}, has {} blocked {}?", host, by, actor)
        }
        Observation::InboxContains { actor, object_id } => {
            format!("On {}, does the inbox of {} contain {}?", host, actor, object_id)
        }
    }
}

#[async_trait]
impl AppDriver for ManualDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::all()
    }

    fn interactive(&self) -> bool {
        true
    }

    async fn provision(&self, role: &str, config: &NodeConfig) -> Result<NodeInstance> {
        let hostname = self.hostname_for(role, config).await?;
        let ready = self
            .confirm(format!(
                "Manually provision the node for role \"{}\" at {} and confirm when it is ready.",
                role, hostname
            ))
            .await?;
        if !ready {
            return Err(Error::provision(
                &self.name,
                format!("operator did not provision {}", hostname),
            ));
        }

        Ok(NodeInstance::new(role, &self.name, hostname)
            .with_config(config)
            .with_capabilities(self.capabilities()))
    }

    async fn deprovision(&self, node: &NodeInstance) -> Result<()> {
        let done = self
            .confirm(format!(
                "Manually deprovision the node for role \"{}\" at {} and confirm when done.",
                node.role, node.hostname
            ))
            .await?;
        if done {
            Ok(())
        } else {
            Err(Error::provision(
                &self.name,
                format!("operator did not deprovision {}", node.hostname),
            ))
        }
    }

    async fn provision_account(
        &self,
        node: &NodeInstance,
        profile: &AccountProfile,
    ) -> Result<AccountHandle> {
        let mut question = format!("On {}, create an account", node.hostname);
        if let Some(role) = &profile.role {
            question.push_str(&format!(" for account role \"{}\"", role));
        }
        if let Some(username) = &profile.username {
            question.push_str(&format!(" with username {}", username));
        }
        question.push_str(" and enter its acct: or https URI:");

        let uri = self.ask(question, uri::http_https_acct_uri).await?;
        Ok(AccountHandle {
            role: profile.role.clone(),
            uri,
            actor_uri: None,
            provisioned: true,
        })
    }

    async fn deprovision_account(&self, node: &NodeInstance, account: &AccountHandle) -> Result<()> {
        let done = self
            .confirm(format!("On {}, delete the account {}.", node.hostname, account.uri))
            .await?;
        if done {
            Ok(())
        } else {
            Err(Error::action(
                "deprovision-account",
                format!("operator did not delete {}", account.uri),
            ))
        }
    }

    async fn observe(&self, node: &NodeInstance, observation: &Observation) -> Result<Value> {
        let answer = self.confirm(describe_observation(node, observation)).await?;
        Ok(Value::Bool(answer))
    }

    async fn control(&self, node: &NodeInstance, action: &Action) -> Result<ResultHandle> {
        let prompt = describe_action(node, action);
        match action {
            Action::CreatePost { .. } | Action::Reply { .. } => {
                let uri = self.ask(prompt, http_uri).await?;
                Ok(ResultHandle::with_uri(uri))
            }
            _ => {
                let succeeded = self
                    .confirm(format!("{} Did it succeed?", prompt))
                    .await?;
                if succeeded {
                    Ok(ResultHandle::empty())
                } else {
                    Err(Error::action(action.name(), "operator reported failure"))
                }
            }
        }
    }
}
