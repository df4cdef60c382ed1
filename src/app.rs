use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use tasksync::api::CachedTaskClient;
use tasksync::cache::{QueryStatus, QueryView};
use tasksync::config::Config;
use tasksync::mock::{MockServer, RecordStore};
use tasksync::mutation::{MutationResult, TaskMutation};
use tasksync::task::{CreateTaskInput, Task, UpdateTaskInput};
use tasksync::transport::{FaultInjectingTransport, HttpTransport, Transport};

use crate::event::{Event, EventHandler};

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
  /// Print the task list
  List,
  /// Create a task
  Add {
    title: String,
    #[arg(short, long, default_value = "")]
    description: String,
  },
  /// Change a task's title or description
  Update {
    id: Uuid,
    #[arg(short, long)]
    title: Option<String>,
    #[arg(short, long)]
    description: Option<String>,
  },
  /// Flip a task between done and not done
  Toggle { id: Uuid },
  /// Delete a task
  Delete { id: Uuid },
  /// Seed the mock store and run a create/toggle/delete cycle
  Demo,
  /// Keep the list open and print every change until Ctrl-C
  Watch {
    /// Seconds between refocus signals
    #[arg(long, default_value_t = 5)]
    tick_secs: u64,
  },
}

pub struct App {
  client: CachedTaskClient,
  /// Present when running against the in-process mock server
  db: Option<Arc<RecordStore>>,
}

impl App {
  pub fn new(config: &Config) -> Result<Self> {
    let (transport, db) = match &config.api.base_url {
      Some(url) => {
        info!(url = %url, "Using HTTP transport");
        let transport = HttpTransport::new(url, Duration::from_secs(config.api.timeout_secs))?;
        (Arc::new(transport) as Arc<dyn Transport>, None)
      }
      None => {
        let db = Arc::new(RecordStore::new());
        let server = MockServer::new(Arc::clone(&db));
        let faults = config.fault_config();
        info!(
          failure_rate = faults.failure_rate,
          network_failure_rate = faults.network_failure_rate,
          latency_ms = config.faults.latency_ms,
          seed = ?config.faults.seed,
          "Using mock transport"
        );
        let transport = match config.faults.seed {
          Some(seed) => FaultInjectingTransport::seeded(server, faults, seed),
          None => FaultInjectingTransport::random(server, faults),
        };
        (Arc::new(transport) as Arc<dyn Transport>, Some(db))
      }
    };

    let client = CachedTaskClient::new(
      transport,
      config.cache_config(),
      config.retry.queries.policy(),
      config.retry.mutations.policy(),
    );
    Ok(Self { client, db })
  }

  pub async fn run(&self, command: Command) -> Result<()> {
    let _gc = self.client.spawn_gc(Duration::from_secs(60));

    match command {
      Command::List => self.list().await,
      Command::Add { title, description } => {
        let result = self
          .client
          .mutate(TaskMutation::Create(CreateTaskInput::new(title, description)))
          .await;
        report(&result);
        self.list().await
      }
      Command::Update {
        id,
        title,
        description,
      } => {
        if title.is_none() && description.is_none() {
          return Err(eyre!("Nothing to update: pass --title and/or --description"));
        }
        let input = UpdateTaskInput {
          title,
          description,
          completed: None,
        };
        let result = self.client.mutate(TaskMutation::Update { id, input }).await;
        report(&result);
        self.list().await
      }
      Command::Toggle { id } => {
        let task = self.current(id).await?;
        let result = self
          .client
          .mutate(TaskMutation::ToggleComplete {
            id,
            completed: !task.completed,
          })
          .await;
        report(&result);
        self.list().await
      }
      Command::Delete { id } => {
        let result = self.client.mutate(TaskMutation::Delete { id }).await;
        report(&result);
        self.list().await
      }
      Command::Demo => self.demo().await,
      Command::Watch { tick_secs } => self.watch(Duration::from_secs(tick_secs)).await,
    }
  }

  async fn list(&self) -> Result<()> {
    let mut tasks = self.client.tasks();
    print_view(&tasks.view());
    let view = tasks.settled().await;
    print_view(&view);
    Ok(())
  }

  async fn current(&self, id: Uuid) -> Result<Task> {
    let tasks = self
      .client
      .fetch_tasks()
      .await
      .map_err(|e| eyre!("Failed to read tasks: {}", e.message))?;
    tasks
      .iter()
      .find(|t| t.id == id)
      .cloned()
      .ok_or_else(|| eyre!("No task with id {}", id))
  }

  async fn demo(&self) -> Result<()> {
    let db = self
      .db
      .as_ref()
      .ok_or_else(|| eyre!("demo needs the mock server; unset api.base_url"))?;
    for (title, description) in [
      ("خرید نان", "از نانوایی سر کوچه"),
      ("Write weekly report", ""),
      ("Call the dentist", "before Thursday"),
    ] {
      db.create(CreateTaskInput::new(title, description));
    }

    let mut tasks = self.client.tasks();
    print_view(&tasks.settled().await);

    let handle = self.client.mutation_handle();
    let created = handle
      .mutate(TaskMutation::Create(CreateTaskInput::new(
        "Try the demo",
        "created by tasksync demo",
      )))
      .await;
    report(&created);
    print_view(&tasks.settled().await);

    let Ok(created) = created else {
      return Ok(());
    };
    let Some(task) = created.task else {
      return Ok(());
    };

    let toggled = handle
      .mutate(TaskMutation::ToggleComplete {
        id: task.id,
        completed: true,
      })
      .await;
    report(&toggled);
    print_view(&tasks.settled().await);

    let deleted = handle.mutate(TaskMutation::Delete { id: task.id }).await;
    report(&deleted);
    print_view(&tasks.settled().await);
    Ok(())
  }

  async fn watch(&self, tick: Duration) -> Result<()> {
    let mut events = EventHandler::new(tick);
    let mut tasks = self.client.tasks();
    print_view(&tasks.view());

    loop {
      tokio::select! {
        view = tasks.changed() => match view {
          Some(view) => print_view(&view),
          None => break,
        },
        event = events.next() => match event {
          Some(Event::Tick) => {
            self.client.on_focus();
          }
          Some(Event::Quit) | None => break,
        },
      }
    }
    Ok(())
  }
}

fn report(result: &MutationResult) {
  match result {
    Ok(success) => println!("✔ {}", success.message),
    Err(failure) => println!(
      "✘ {} ({} attempt(s))",
      failure.message(),
      failure.record.attempts_made
    ),
  }
}

fn print_view(view: &QueryView<Vec<Task>>) {
  match view.status {
    QueryStatus::Idle => println!("[idle]"),
    QueryStatus::Fetching if view.is_loading() => println!("[loading]"),
    QueryStatus::Fetching => println!("[refreshing]"),
    QueryStatus::Success => println!("[ok]"),
    QueryStatus::Error => println!(
      "[error] {}",
      view.error().map(|e| e.message.as_str()).unwrap_or_default()
    ),
  }

  let Some(tasks) = view.data() else {
    return;
  };
  if tasks.is_empty() {
    println!("  (no tasks)");
  }
  for task in tasks {
    let mark = if task.completed { "x" } else { " " };
    println!("  [{}] {}  {}", mark, task.id, task.title);
    if !task.description.is_empty() {
      println!("        {}", task.description);
    }
  }
}
