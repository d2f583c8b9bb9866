//! Wraps the helper child in a Windows Job Object so shutdown can take
//! down the whole process tree it may have spawned, not just the one
//! `Child` handle tokio hands back.

#![cfg(windows)]

use windows::Win32::Foundation::CloseHandle;
use windows::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation, SetInformationJobObject,
    TerminateJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION, JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
};
use windows::Win32::System::Threading::{OpenProcess, PROCESS_SET_QUOTA, PROCESS_TERMINATE};

pub struct ProcessJob {
    handle: windows::Win32::Foundation::HANDLE,
}

impl ProcessJob {
    /// Creates a job object and assigns the process identified by `pid` to
    /// it. Processes that process spawns with default inheritance join the
    /// same job, so terminating the job reaches the whole tree.
    pub fn attach(pid: u32) -> windows::core::Result<Self> {
        let job = unsafe { CreateJobObjectW(None, None) }?;

        let mut info = JOBOBJECT_EXTENDED_LIMIT_INFORMATION::default();
        info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
        unsafe {
            SetInformationJobObject(
                job,
                JobObjectExtendedLimitInformation,
                &info as *const _ as *const _,
                std::mem::size_of_val(&info) as u32,
            )
        }?;

        let process = unsafe { OpenProcess(PROCESS_SET_QUOTA | PROCESS_TERMINATE, false, pid) }?;
        let assign_result = unsafe { AssignProcessToJobObject(job, process) };
        unsafe {
            let _ = CloseHandle(process);
        }
        assign_result?;

        Ok(Self { handle: job })
    }

    /// Kills every process still in the job, including anything the
    /// helper spawned that tokio's `Child` never knew about.
    pub fn terminate_tree(&self) {
        unsafe {
            let _ = TerminateJobObject(self.handle, 1);
        }
    }
}

impl Drop for ProcessJob {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}
