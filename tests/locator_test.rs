use kybernate::locator::{expand_candidates, FakeQuery, GpuLocator};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

/// A synthetic /proc tree the locator can walk.
struct ProcFixture {
    dir: TempDir,
}

impl ProcFixture {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn add_process(&self, pid: u32) {
        fs::create_dir_all(self.root().join(pid.to_string())).unwrap();
    }

    fn set_cgroup(&self, pid: u32, content: &str) {
        self.add_process(pid);
        fs::write(self.root().join(pid.to_string()).join("cgroup"), content).unwrap();
    }

    fn set_parent(&self, pid: u32, comm: &str, ppid: u32) {
        self.add_process(pid);
        fs::write(
            self.root().join(pid.to_string()).join("stat"),
            format!("{pid} ({comm}) S {ppid} {pid} {pid} 0 -1 4194304 100 0 0 0"),
        )
        .unwrap();
    }

    fn set_children(&self, pid: u32, children: &[u32]) {
        let task = self
            .root()
            .join(pid.to_string())
            .join("task")
            .join(pid.to_string());
        fs::create_dir_all(&task).unwrap();
        let list: Vec<String> = children.iter().map(|c| c.to_string()).collect();
        fs::write(task.join("children"), list.join(" ")).unwrap();
    }

    fn set_cmdline(&self, pid: u32, cmdline: &[&str]) {
        self.add_process(pid);
        fs::write(
            self.root().join(pid.to_string()).join("cmdline"),
            cmdline.join("\0"),
        )
        .unwrap();
    }

    fn locator(&self, query: FakeQuery) -> GpuLocator {
        GpuLocator::with_parts(Box::new(query), self.root().to_path_buf())
            .with_runc("/nonexistent/runc".to_string(), self.root().join("runc"))
            .with_task_state_root(self.root().join("task-state"))
            .with_retry(Duration::from_millis(0), Duration::from_millis(1))
    }
}

#[test]
fn test_locate_by_cgroup_match() {
    let fixture = ProcFixture::new();
    let query = FakeQuery::new();
    query.add(1000, 512 << 20, "python3");
    query.add(1500, 2048 << 20, "trainer");

    fixture.set_cgroup(1000, "0::/kubepods.slice/cri-containerd-otherY.scope\n");
    fixture.set_cgroup(1500, "0::/kubepods.slice/cri-containerd-containerX.scope\n");

    let locator = fixture.locator(query);
    assert_eq!(locator.find_for_container("containerX"), Some(1500));
}

#[test]
fn test_locate_returns_none_without_match() {
    let fixture = ProcFixture::new();
    let query = FakeQuery::new();
    query.add(1000, 512 << 20, "python3");
    fixture.set_cgroup(1000, "0::/kubepods.slice/cri-containerd-otherY.scope\n");

    let locator = fixture.locator(query);
    assert_eq!(locator.find_for_container("containerX"), None);
}

#[test]
fn test_locate_by_process_tree_descent() {
    let fixture = ProcFixture::new();
    let query = FakeQuery::new();
    query.add(2000, 1 << 30, "trainer");
    query.add(3000, 1 << 30, "unrelated");

    // 2000 is a grandchild of init PID 1200; 3000 hangs off another tree.
    fixture.set_parent(1200, "bash", 1);
    fixture.set_parent(1900, "launcher", 1200);
    fixture.set_parent(2000, "trainer", 1900);
    fixture.set_parent(3000, "other", 1);

    let locator = fixture.locator(query);
    assert_eq!(locator.find_for_task(1200), Some(2000));
}

#[test]
fn test_locate_by_children_walk() {
    let fixture = ProcFixture::new();
    let query = FakeQuery::new();
    query.add(1400, 1 << 30, "trainer");

    // No stat files, so the parent walk finds nothing; the children
    // files still lead from the init to the GPU process.
    fixture.add_process(1200);
    fixture.set_children(1200, &[1300]);
    fixture.set_children(1300, &[1400]);
    fixture.add_process(1400);

    let locator = fixture.locator(query);
    assert_eq!(locator.find_for_task(1200), Some(1400));
}

#[test]
fn test_locate_handles_comm_with_parentheses() {
    let fixture = ProcFixture::new();
    let query = FakeQuery::new();
    query.add(2000, 1 << 20, "weird");

    fixture.set_parent(1200, "init", 1);
    fixture.set_parent(2000, "a) (b", 1200);

    let locator = fixture.locator(query);
    assert_eq!(locator.find_for_task(1200), Some(2000));
}

#[test]
fn test_init_pid_from_bundle_pid_file() {
    let fixture = ProcFixture::new();
    fixture.add_process(4242);

    let bundle = TempDir::new().unwrap();
    fs::write(bundle.path().join("init.pid"), "4242\n").unwrap();

    let locator = fixture.locator(FakeQuery::new());
    let pid = locator
        .resolve_init_pid(bundle.path(), &["whatever".to_string()])
        .unwrap();
    assert_eq!(pid, 4242);
}

#[test]
fn test_init_pid_ignores_dead_pid_file() {
    let fixture = ProcFixture::new();
    // 4242 has no /proc entry, so the pid file is stale.
    let bundle = TempDir::new().unwrap();
    fs::write(bundle.path().join("init.pid"), "4242\n").unwrap();

    let locator = fixture.locator(FakeQuery::new());
    assert!(locator
        .resolve_init_pid(bundle.path(), &["id".to_string()])
        .is_err());
}

#[test]
fn test_init_pid_from_task_state_path() {
    let fixture = ProcFixture::new();
    fixture.add_process(5150);

    let task_dir = fixture.root().join("task-state").join("k8s.io").join("abc123");
    fs::create_dir_all(&task_dir).unwrap();
    fs::write(task_dir.join("init.pid"), "5150").unwrap();

    let bundle = TempDir::new().unwrap();
    let locator = fixture.locator(FakeQuery::new());
    let pid = locator
        .resolve_init_pid(bundle.path(), &["abc123".to_string()])
        .unwrap();
    assert_eq!(pid, 5150);
}

#[test]
fn test_init_pid_from_cgroup_scan_takes_lowest() {
    let fixture = ProcFixture::new();
    fixture.set_cgroup(900, "0::/kubepods.slice/cri-containerd-abc123.scope\n");
    fixture.set_cgroup(950, "0::/kubepods.slice/cri-containerd-abc123.scope\n");
    fixture.set_cgroup(800, "0::/system.slice/sshd.service\n");

    let bundle = TempDir::new().unwrap();
    let locator = fixture.locator(FakeQuery::new());
    let pid = locator
        .resolve_init_pid(bundle.path(), &["abc123".to_string()])
        .unwrap();
    assert_eq!(pid, 900);
}

#[test]
fn test_init_pid_from_shim_first_child() {
    let fixture = ProcFixture::new();
    fixture.set_cmdline(
        600,
        &[
            "/usr/bin/containerd-shim-kybernate-v1",
            "-id",
            "abc123def456",
        ],
    );
    fixture.set_children(600, &[601]);
    fixture.add_process(601);

    let bundle = TempDir::new().unwrap();
    let locator = fixture.locator(FakeQuery::new());
    let pid = locator
        .resolve_init_pid(bundle.path(), &["abc123def456".to_string()])
        .unwrap();
    assert_eq!(pid, 601);
}

#[test]
fn test_init_pid_resolution_exhausts_budget() {
    let fixture = ProcFixture::new();
    let bundle = TempDir::new().unwrap();
    let locator = fixture.locator(FakeQuery::new());
    let err = locator
        .resolve_init_pid(bundle.path(), &["nothing".to_string()])
        .unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_candidate_expansion_keeps_full_ids_and_prefixes() {
    let ids = expand_candidates(
        "0123456789abcdef0123456789abcdef",
        Path::new("/run/bundle/0123456789abcdef0123456789abcdef"),
        Some("fedcba9876543210"),
    );
    // Every ID longer than 12 characters appears with its prefix too.
    assert!(ids.contains(&"0123456789abcdef0123456789abcdef".to_string()));
    assert!(ids.contains(&"0123456789ab".to_string()));
    assert!(ids.contains(&"fedcba9876543210".to_string()));
    assert!(ids.contains(&"fedcba987654".to_string()));
}

#[test]
fn test_cgroup_match_works_with_prefix_candidate() {
    let fixture = ProcFixture::new();
    let query = FakeQuery::new();
    query.add(1500, 1 << 30, "trainer");
    fixture.set_cgroup(
        1500,
        "0::/kubepods.slice/cri-containerd-0123456789ab.scope\n",
    );

    let candidates = expand_candidates(
        "0123456789abcdef0123456789abcdef",
        Path::new("/bundle"),
        None,
    );
    let locator = fixture.locator(query);
    assert_eq!(locator.locate(&candidates, None), Some(1500));
}
