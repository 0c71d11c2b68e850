//! Test data builders for queue messages and task records

use runner_domain::entities::{Message, NewTask, Task, TaskExecutionMessage};
use runner_domain::value_objects::summarize_script_content;
use uuid::Uuid;

/// Builder for task execution requests, defaults to `print('hi')` as `hello.py`
pub struct TaskExecutionMessageBuilder {
    message: TaskExecutionMessage,
}

impl TaskExecutionMessageBuilder {
    pub fn new() -> Self {
        Self {
            message: TaskExecutionMessage {
                task_id: Uuid::new_v4().to_string(),
                host: "192.168.1.100".to_string(),
                script_name: "hello.py".to_string(),
                script_content: "print('hi')".to_string(),
            },
        }
    }

    pub fn with_task_id(mut self, task_id: &str) -> Self {
        self.message.task_id = task_id.to_string();
        self
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.message.host = host.to_string();
        self
    }

    pub fn with_script(mut self, script_name: &str, script_content: &str) -> Self {
        self.message.script_name = script_name.to_string();
        self.message.script_content = script_content.to_string();
        self
    }

    pub fn build(&self) -> TaskExecutionMessage {
        self.message.clone()
    }

    /// Queue envelope around the request
    pub fn build_message(&self) -> Message {
        Message::task_execution(self.build())
    }

    /// The matching store record input
    pub fn build_new_task(&self) -> NewTask {
        NewTask::new(
            self.message.task_id.clone(),
            self.message.host.clone(),
            self.message.script_name.clone(),
            summarize_script_content(&self.message.script_content),
        )
    }

    /// A `queued` task record for the request
    pub fn build_task(&self) -> Task {
        Task::new(self.build_new_task())
    }
}

impl Default for TaskExecutionMessageBuilder {
    fn default() -> Self {
        Self::new()
    }
}
