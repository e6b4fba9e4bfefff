//! The outgoing command stream.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::command::{Command, CommandListType};
use crate::model::{CommandKey, KeyAllocator, ObjectKey};

/// Bytes injected into a `Map`/`Unmap` pair on replay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedData {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

/// A command as written to the outgoing stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordedCommand {
    pub key: CommandKey,
    pub command: Command,
    /// Side channel carrying captured bytes for `Unmap`.
    pub mapped_data: Option<MappedData>,
}

/// Destination of the outgoing stream.
pub trait CommandSink {
    fn write(&mut self, record: RecordedCommand);
}

impl<S: CommandSink + ?Sized> CommandSink for &mut S {
    fn write(&mut self, record: RecordedCommand) {
        (**self).write(record);
    }
}

/// Collects the outgoing stream in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Vec<RecordedCommand>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[RecordedCommand] {
        &self.records
    }

    pub fn into_records(self) -> Vec<RecordedCommand> {
        self.records
    }

    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        self.records.iter().map(|record| &record.command)
    }

    pub fn count(&self, entry_point: &str) -> usize {
        self.commands()
            .filter(|command| command.entry_point() == entry_point)
            .count()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl CommandSink for MemorySink {
    fn write(&mut self, record: RecordedCommand) {
        self.records.push(record);
    }
}

/// Writer for synthesized commands: every command and object it produces gets a key from the
/// restore range.
pub struct RestoreStream<'a> {
    sink: &'a mut dyn CommandSink,
    keys: &'a mut KeyAllocator,
    written: u64,
}

impl<'a> RestoreStream<'a> {
    pub fn new(sink: &'a mut dyn CommandSink, keys: &'a mut KeyAllocator) -> Self {
        Self {
            sink,
            keys,
            written: 0,
        }
    }

    pub fn emit(&mut self, command: Command) -> CommandKey {
        self.write(command, None)
    }

    pub fn emit_with_data(&mut self, command: Command, data: MappedData) -> CommandKey {
        self.write(command, Some(data))
    }

    fn write(&mut self, command: Command, mapped_data: Option<MappedData>) -> CommandKey {
        let key = self.keys.command();
        trace!(%key, entry_point = command.entry_point(), "restore command");
        self.sink.write(RecordedCommand {
            key,
            command,
            mapped_data,
        });
        self.written += 1;
        key
    }

    /// Allocates the key of an object synthesized for restore.
    pub fn new_object(&mut self) -> ObjectKey {
        self.keys.object()
    }

    /// Number of commands written through this stream.
    pub fn written(&self) -> u64 {
        self.written
    }
}

/// A queue, allocator, list and fence created in the outgoing stream for restore work.
///
/// The list is left open after creation and after every [`RestoreQueue::submit_and_wait`], so
/// callers only ever record into it.
#[derive(Debug)]
pub struct RestoreQueue {
    pub queue: ObjectKey,
    pub allocator: ObjectKey,
    pub list: ObjectKey,
    pub fence: ObjectKey,
    pub list_type: CommandListType,
    fence_value: u64,
    recorded: usize,
}

impl RestoreQueue {
    pub fn create(
        stream: &mut RestoreStream<'_>,
        device: ObjectKey,
        list_type: CommandListType,
    ) -> Self {
        let queue = stream.new_object();
        let allocator = stream.new_object();
        let list = stream.new_object();
        let fence = stream.new_object();
        stream.emit(Command::CreateCommandQueue {
            device,
            queue,
            list_type,
        });
        stream.emit(Command::CreateCommandAllocator {
            device,
            allocator,
            list_type,
        });
        stream.emit(Command::CreateCommandList {
            device,
            list,
            allocator,
            list_type,
            initial_pipeline: None,
        });
        stream.emit(Command::CreateFence {
            device,
            fence,
            initial_value: 0,
        });
        Self {
            queue,
            allocator,
            list,
            fence,
            list_type,
            fence_value: 0,
            recorded: 0,
        }
    }

    /// Records a command-list command onto this queue's list.
    pub fn record(&mut self, stream: &mut RestoreStream<'_>, mut command: Command) {
        command.set_command_list(self.list);
        stream.emit(command);
        self.recorded += 1;
    }

    pub fn has_recorded(&self) -> bool {
        self.recorded > 0
    }

    /// Closes and executes the list and signals the fence; returns the signalled value.
    pub fn execute(&mut self, stream: &mut RestoreStream<'_>) -> u64 {
        stream.emit(Command::CommandListClose { list: self.list });
        stream.emit(Command::ExecuteCommandLists {
            queue: self.queue,
            lists: vec![self.list],
        });
        self.signal(stream)
    }

    pub fn signal(&mut self, stream: &mut RestoreStream<'_>) -> u64 {
        self.fence_value += 1;
        stream.emit(Command::QueueSignal {
            queue: self.queue,
            fence: self.fence,
            value: self.fence_value,
        });
        self.fence_value
    }

    /// GPU-side wait for another queue's fence.
    pub fn wait_for(&self, stream: &mut RestoreStream<'_>, other: &RestoreQueue, value: u64) {
        stream.emit(Command::QueueWait {
            queue: self.queue,
            fence: other.fence,
            value,
        });
    }

    /// CPU wait for the last signalled value, then reopen the list.
    pub fn wait_and_reset(&mut self, stream: &mut RestoreStream<'_>) {
        stream.emit(Command::WaitForFence {
            fence: self.fence,
            value: self.fence_value,
        });
        stream.emit(Command::CommandAllocatorReset {
            allocator: self.allocator,
        });
        stream.emit(Command::CommandListReset {
            list: self.list,
            allocator: self.allocator,
            initial_pipeline: None,
        });
        self.recorded = 0;
    }

    pub fn submit_and_wait(&mut self, stream: &mut RestoreStream<'_>) {
        self.execute(stream);
        self.wait_and_reset(stream);
    }

    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }

    /// Releases every object created by [`RestoreQueue::create`]. The list is closed first.
    pub fn release(self, stream: &mut RestoreStream<'_>) {
        stream.emit(Command::CommandListClose { list: self.list });
        for object in [self.list, self.allocator, self.fence, self.queue] {
            stream.emit(Command::Release { object });
        }
    }
}
